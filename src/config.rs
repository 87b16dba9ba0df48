//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MXSHELL_CONFIG` (environment variable)
//! 2. `~/.config/mxshell/config.toml` (Linux/macOS)
//!    `%APPDATA%\mxshell\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MxError, Result};
use crate::lock::LockSettings;
use crate::model::kind::MailboxKind;
use crate::prompt::QuadOption;
use crate::session::sort::SortKey;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Mailbox lifecycle policy.
    pub mailbox: MailboxConfig,
    /// Locking protocol.
    pub lock: LockConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Language for prompts and notices ("en", "es"). Defaults to the system locale.
    pub lang: Option<String>,
}

/// Per-path override of the read-mail relocation target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MboxHook {
    /// Mailbox the hook applies to.
    pub path: PathBuf,
    /// Where read messages from that mailbox are moved.
    pub target: PathBuf,
}

/// Mailbox lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Kind used for new and zero-length mailboxes: "mbox", "mmdf", "mh", "maildir".
    pub default_kind: String,
    /// The system spool mailbox.
    pub spool: Option<PathBuf>,
    /// Where read messages are moved when leaving the spool.
    pub inbox: Option<PathBuf>,
    /// Deleted messages are copied here before being purged.
    pub trash: Option<PathBuf>,
    /// Move read messages out of the spool on close.
    pub move_read: QuadOption,
    /// Purge deleted messages on sync/close.
    pub delete: QuadOption,
    /// Mark all articles read on the server when leaving a newsgroup.
    pub catchup: QuadOption,
    /// Keep a flat-file mailbox on disk when it becomes empty.
    pub save_empty: bool,
    /// Flagged messages are never moved to the inbox.
    pub keep_flagged: bool,
    /// Maildir deletion only sets the trashed flag instead of removing files.
    pub maildir_trash: bool,
    /// Unread messages that were not opened become old on close.
    pub mark_old: bool,
    /// New mail is tracked by size, so access times need not be restored.
    pub check_mbox_size: bool,
    /// View order: "mailbox", "date", "received", "subject", "size", optional "reverse-" prefix.
    pub sort: String,
    /// Per-mailbox relocation targets.
    pub mbox_hooks: Vec<MboxHook>,
    /// Envelope sender for generated `From ` lines when a message has none.
    pub username: Option<String>,
    /// File suffixes handled by a compression collaborator (e.g. ".gz").
    pub compressed_suffixes: Vec<String>,
}

/// Locking protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Take a kernel advisory lock on flat files.
    pub fcntl: bool,
    /// Also take a cooperative `.lock` sentinel file.
    pub dotlock: bool,
    /// Contention rounds before giving up.
    pub attempts: u32,
    /// Delay between contention polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Age after which a sentinel lock file is offered for removal, in seconds.
    pub stale_after_secs: u64,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
            lang: None,
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            default_kind: "mbox".to_string(),
            spool: None,
            inbox: None,
            trash: None,
            move_read: QuadOption::No,
            delete: QuadOption::AskYes,
            catchup: QuadOption::AskYes,
            save_empty: true,
            keep_flagged: false,
            maildir_trash: false,
            mark_old: true,
            check_mbox_size: false,
            sort: "date".to_string(),
            mbox_hooks: Vec::new(),
            username: None,
            compressed_suffixes: Vec::new(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            fcntl: true,
            dotlock: true,
            attempts: 5,
            poll_interval_ms: 1000,
            stale_after_secs: 300,
        }
    }
}

// ── Derived settings ────────────────────────────────────────────

impl Config {
    /// The configured default kind, falling back to mbox when unset or invalid.
    pub fn default_kind(&self) -> MailboxKind {
        match MailboxKind::from_default_name(&self.mailbox.default_kind) {
            Some(kind) => kind,
            None => {
                tracing::warn!(
                    value = %self.mailbox.default_kind,
                    "Unknown default mailbox type, using mbox"
                );
                MailboxKind::Mbox
            }
        }
    }

    /// Change the default kind. Unknown names are rejected and leave the setting untouched.
    pub fn set_default_kind(&mut self, name: &str) -> Result<()> {
        let kind = MailboxKind::from_default_name(name)
            .ok_or_else(|| MxError::InvalidPath(format!("unknown mailbox type '{name}'")))?;
        self.mailbox.default_kind = kind.name().to_ascii_lowercase();
        Ok(())
    }

    /// Sort key for the view, falling back to storage order.
    pub fn sort_key(&self) -> SortKey {
        SortKey::parse(&self.mailbox.sort).unwrap_or_else(|| {
            tracing::warn!(value = %self.mailbox.sort, "Unknown sort order, using mailbox order");
            SortKey::default()
        })
    }

    /// Locking parameters for the lock service.
    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            kernel: self.lock.fcntl,
            attempts: self.lock.attempts,
            poll_interval: Duration::from_millis(self.lock.poll_interval_ms),
            stale_after: Duration::from_secs(self.lock.stale_after_secs),
        }
    }

    /// Whether `path` names the configured spool.
    pub fn is_spool(&self, path: &Path) -> bool {
        self.mailbox.spool.as_deref() == Some(path)
    }

    /// Whether `path` names the configured trash.
    pub fn is_trash(&self, path: &Path) -> bool {
        self.mailbox.trash.as_deref() == Some(path)
    }

    /// First relocation hook registered for `path`.
    pub fn find_mbox_hook(&self, path: &Path) -> Option<&Path> {
        self.mailbox
            .mbox_hooks
            .iter()
            .find(|hook| hook.path == path)
            .map(|hook| hook.target.as_path())
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MXSHELL_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    dirs::config_dir().map(|d| d.join("mxshell").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mxshell")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("mxshell.log")
}
