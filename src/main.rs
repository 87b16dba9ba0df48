//! CLI entry point for `mxShell`.

use std::io::{IsTerminal, Read, Write};
use std::path::{Path, PathBuf};

use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mxshell::backend::CheckOutcome;
use mxshell::config::Config;
use mxshell::i18n;
use mxshell::prompt::{AlwaysAnswer, Answer, NonInteractive, Prompt, TerminalPrompt};
use mxshell::session::NewMessageOptions;
use mxshell::{CloseOutcome, Flag, Mx, MxError, OpenFlags, SyncOutcome};

/// Exit status used when index growth overflowed.
const EXIT_FATAL: i32 = 70;

#[derive(Parser)]
#[command(name = "mxshell", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Language (en, es). Defaults to system locale.
    #[arg(long, value_name = "LANG", global = true)]
    lang: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the mailbox type of each path
    Detect {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Open a mailbox read-only and show its counters
    Info {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Tell whether a mailbox holds any message
    Empty {
        path: PathBuf,
    },
    /// Check a mailbox for new mail
    Check {
        path: PathBuf,
    },
    /// Delete messages by number and close the mailbox
    Delete {
        path: PathBuf,
        /// Message numbers, starting at 1
        #[arg(required = true)]
        numbers: Vec<usize>,
        /// Answer yes to every question
        #[arg(short, long)]
        yes: bool,
    },
    /// Append message files to a mailbox, creating it if needed
    Append {
        mailbox: PathBuf,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Write pending changes of a mailbox back to disk
    Sync {
        path: PathBuf,
        /// Answer yes to every question
        #[arg(short, long)]
        yes: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

/// Detect language early from --lang arg, the config file or system env,
/// before clap processes --help.
fn detect_lang_early(configured: Option<&str>) -> i18n::Lang {
    // Check --lang flag in raw args
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--lang" {
            if let Some(code) = args.get(i + 1) {
                if let Some(lang) = i18n::Lang::from_code(code) {
                    return lang;
                }
            }
        }
        if let Some(code) = args[i].strip_prefix("--lang=") {
            if let Some(lang) = i18n::Lang::from_code(code) {
                return lang;
            }
        }
    }
    configured
        .and_then(i18n::Lang::from_code)
        .unwrap_or_else(i18n::detect_system_lang)
}

/// Build a localized clap Command using i18n strings.
fn build_localized_command() -> clap::Command {
    let mut cmd = Cli::command();
    cmd = cmd
        .about(i18n::app_about())
        .long_about(i18n::app_long_about())
        .after_help(i18n::app_after_help())
        .mut_arg("verbose", |a| a.help(i18n::help_verbose()))
        .mut_arg("lang", |a| a.help(i18n::help_lang()));

    // Localize subcommands
    let subcommands: Vec<clap::Command> = cmd
        .get_subcommands()
        .map(|sub| {
            let mut s = sub.clone();
            match s.get_name() {
                "detect" => { s = s.about(i18n::help_cmd_detect()); }
                "info" => { s = s.about(i18n::help_cmd_info()); }
                "empty" => { s = s.about(i18n::help_cmd_empty()); }
                "check" => { s = s.about(i18n::help_cmd_check()); }
                "delete" => { s = s.about(i18n::help_cmd_delete()); }
                "append" => { s = s.about(i18n::help_cmd_append()); }
                "sync" => { s = s.about(i18n::help_cmd_sync()); }
                "completions" => { s = s.about(i18n::help_cmd_completions()); }
                "manpage" => { s = s.about(i18n::help_cmd_manpage()); }
                _ => {}
            }
            s
        })
        .collect();

    // Replace subcommands (clear and re-add)
    for sub in subcommands {
        cmd = cmd.mut_subcommand(sub.get_name(), |_| sub.clone());
    }

    cmd
}

fn main() -> anyhow::Result<()> {
    let config = mxshell::config::load_config();

    // Detect language BEFORE clap parsing so --help is localized
    let lang = detect_lang_early(config.general.lang.as_deref());
    i18n::set_lang(lang);

    let cmd = build_localized_command();
    let matches = cmd.get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.clone(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    setup_logging(&log_level, &config);

    let result = match cli.command {
        Commands::Detect { paths } => cmd_detect(&paths, config),
        Commands::Info { path, json } => cmd_info(&path, json, config),
        Commands::Empty { path } => cmd_empty(&path, config),
        Commands::Check { path } => cmd_check(&path, config),
        Commands::Delete { path, numbers, yes } => cmd_delete(&path, &numbers, yes, config),
        Commands::Append { mailbox, files } => cmd_append(&mailbox, &files, config),
        Commands::Sync { path, yes } => cmd_sync(&path, yes, config),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    };

    if let Err(e) = &result {
        if e.downcast_ref::<MxError>().is_some_and(MxError::is_fatal) {
            eprintln!("{e}");
            std::process::exit(EXIT_FATAL);
        }
    }
    result
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Try to set up file logging
    let log_dir = mxshell::config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "mxshell.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// The prompt for commands that may ask: `--yes`, a terminal, or defaults.
fn make_prompt(yes: bool) -> Box<dyn Prompt> {
    if yes {
        Box::new(AlwaysAnswer(Answer::Yes))
    } else if std::io::stdin().is_terminal() {
        Box::new(TerminalPrompt::new(
            std::io::stdin().lock(),
            std::io::stderr(),
        ))
    } else {
        Box::new(NonInteractive)
    }
}

fn ensure_exists(path: &Path) -> anyhow::Result<()> {
    if mxshell::detect::remote_kind(&path.to_string_lossy()).is_none() && !path.exists() {
        anyhow::bail!("{}: {}", i18n::err_file_not_found(), path.display());
    }
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mxshell", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::stdout().write_all(&buf)?;
    Ok(())
}

/// Classify each path and print its kind.
fn cmd_detect(paths: &[PathBuf], config: Config) -> anyhow::Result<()> {
    let mx = Mx::non_interactive(config);
    for path in paths {
        match mx.classify(path) {
            Ok(mxshell::model::MailboxKind::Unknown) => {
                println!("  {:<40} {}", path.display(), i18n::msg_not_a_mailbox());
            }
            Ok(kind) => println!("  {:<40} {kind}", path.display()),
            Err(e) => println!("  {:<40} {e}", path.display()),
        }
    }
    Ok(())
}

/// Open a mailbox in peek mode and print its counters.
fn cmd_info(path: &Path, json: bool, config: Config) -> anyhow::Result<()> {
    ensure_exists(path)?;
    let mut mx = Mx::non_interactive(config);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .expect("valid template"),
    );
    spinner.set_message(format!("{} {}", i18n::msg_reading(), path.display()));
    let opened = mx.open_mailbox(path, OpenFlags::peek());
    spinner.finish_and_clear();
    let mut mb = opened?;

    let c = *mb.counters();
    if json {
        let stats = serde_json::json!({
            "path": path.to_string_lossy(),
            "type": mb.kind().name(),
            "messages": mb.msg_count(),
            "unread": c.unread,
            "new": c.new,
            "flagged": c.flagged,
            "deleted": c.deleted,
            "size": c.size,
            "interrupted": mb.was_interrupted(),
        });
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        use humansize::{format_size, BINARY};
        println!();
        println!("  {:<20} {}", i18n::label_path(), path.display());
        println!("  {:<20} {}", i18n::label_type(), mb.kind());
        println!("  {:<20} {}", i18n::label_messages(), mb.msg_count());
        println!("  {:<20} {}", i18n::label_unread(), c.unread);
        println!("  {:<20} {}", i18n::label_new(), c.new);
        println!("  {:<20} {}", i18n::label_flagged(), c.flagged);
        println!("  {:<20} {}", i18n::label_deleted(), c.deleted);
        println!("  {:<20} {}", i18n::label_size(), format_size(c.size, BINARY));
        println!();
    }
    mx.fast_close(&mut mb);
    Ok(())
}

/// Probe a mailbox for messages without opening a session.
fn cmd_empty(path: &Path, config: Config) -> anyhow::Result<()> {
    ensure_exists(path)?;
    let mx = Mx::non_interactive(config);
    let empty = mx.is_empty(path)?;
    println!(
        "  {} {}",
        path.display(),
        if empty { i18n::msg_empty() } else { i18n::msg_not_empty() }
    );
    Ok(())
}

/// Open, check once for new mail, and close without saving.
fn cmd_check(path: &Path, config: Config) -> anyhow::Result<()> {
    ensure_exists(path)?;
    let mut mx = Mx::non_interactive(config);
    let mut mb = mx.open_mailbox(path, OpenFlags::readonly())?;
    let outcome = mx.check_mailbox(&mut mb)?;
    match outcome {
        CheckOutcome::Unchanged => println!("  {}", i18n::msg_no_new_mail()),
        CheckOutcome::NewMail => println!("  {}", i18n::msg_new_mail()),
        CheckOutcome::Reopened => println!("  {}", i18n::msg_reopened()),
    }
    println!("  {:<20} {}", i18n::label_new(), mb.counters().new);
    mx.fast_close(&mut mb);
    Ok(())
}

/// Mark messages deleted and run the full close pipeline.
fn cmd_delete(path: &Path, numbers: &[usize], yes: bool, config: Config) -> anyhow::Result<()> {
    ensure_exists(path)?;
    let mut mx = Mx::new(config, make_prompt(yes));
    let mut mb = mx.open_mailbox(path, OpenFlags::default())?;
    for &n in numbers {
        if n == 0 || n > mb.msg_count() {
            mx.fast_close(&mut mb);
            anyhow::bail!("{}: {n}", i18n::err_bad_message_number());
        }
        mb.set_flag(n - 1, Flag::Delete, true)?;
    }

    match mx.close_mailbox(&mut mb)? {
        CloseOutcome::Unchanged => println!("  {}", i18n::msg_unchanged()),
        CloseOutcome::Saved(s) => println!("  {}", i18n::close_summary(s.kept, s.moved, s.deleted)),
        CloseOutcome::Aborted => {
            mx.fast_close(&mut mb);
            println!("  {}", i18n::msg_aborted());
        }
    }
    Ok(())
}

/// Append each file as a new message.
fn cmd_append(mailbox: &Path, files: &[PathBuf], config: Config) -> anyhow::Result<()> {
    for file in files {
        ensure_exists(file)?;
    }
    let sender = config.mailbox.username.clone();
    let mut mx = Mx::non_interactive(config);
    let mut mb = mx.open_append(mailbox, OpenFlags::default())?;

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} {} [{{bar:40.cyan/blue}}] {{pos}}/{{len}}",
                i18n::msg_appending()
            ))
            .expect("valid template")
            .progress_chars("#>-"),
    );

    let mut appended = 0usize;
    let mut failure = None;
    for file in files {
        if let Err(e) = append_file(&mut mb, file, sender.clone()) {
            failure = Some(e);
            break;
        }
        appended += 1;
        pb.inc(1);
    }
    pb.finish_and_clear();
    mx.fast_close(&mut mb);

    println!("  {} {appended} → {}", i18n::msg_appended(), mailbox.display());
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn append_file(
    mb: &mut mxshell::Mailbox,
    file: &Path,
    sender: Option<String>,
) -> anyhow::Result<()> {
    let mut raw = Vec::new();
    std::fs::File::open(file)?.read_to_end(&mut raw)?;
    // A leading envelope line belongs to the source mbox, not the message.
    let body = if raw.starts_with(b"From ") {
        raw.iter()
            .position(|&b| b == b'\n')
            .map_or(&raw[..0], |i| &raw[i + 1..])
    } else {
        &raw[..]
    };

    let opts = NewMessageOptions {
        add_from: true,
        draft: false,
        sender_fallback: sender,
    };
    let mut msg = mb.open_new_message(None, opts)?;
    msg.write_all(body)?;
    mb.commit_message(&mut msg)?;
    mb.close_message(msg)?;
    Ok(())
}

/// Open and checkpoint.
fn cmd_sync(path: &Path, yes: bool, config: Config) -> anyhow::Result<()> {
    ensure_exists(path)?;
    let mut mx = Mx::new(config, make_prompt(yes));
    let mut mb = mx.open_mailbox(path, OpenFlags::default())?;
    match mx.sync_mailbox(&mut mb)? {
        SyncOutcome::Unchanged => println!("  {}", i18n::msg_unchanged()),
        SyncOutcome::Synced(s) => println!("  {}", i18n::close_summary(s.kept, 0, s.deleted)),
        SyncOutcome::Removed => println!("  {}", i18n::msg_checkpointed()),
        SyncOutcome::Aborted => println!("  {}", i18n::msg_aborted()),
    }
    mx.fast_close(&mut mb);
    Ok(())
}
