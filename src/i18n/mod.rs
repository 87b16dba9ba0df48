//! Internationalization (i18n) module.
//!
//! Provides localized strings for confirmation questions, status notices
//! and CLI output. English is the default language; Spanish is available
//! as an alternative.

use std::sync::OnceLock;

static CURRENT_LANG: OnceLock<Lang> = OnceLock::new();

/// Supported languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lang {
    /// English (default)
    En,
    /// Spanish
    Es,
}

impl Lang {
    /// Parse a language code string (e.g. "en", "es", "en_US", "es_ES").
    /// Returns `None` for unrecognized codes.
    pub fn from_code(code: &str) -> Option<Self> {
        let normalized = code.to_lowercase();
        let prefix = normalized.split(['_', '-']).next().unwrap_or("");
        match prefix {
            "en" => Some(Self::En),
            "es" => Some(Self::Es),
            _ => None,
        }
    }

    /// Return the ISO 639-1 code for this language.
    pub fn code(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Es => "es",
        }
    }
}

/// Initialize the global language. Call once at startup.
/// If already initialized, this is a no-op.
pub fn set_lang(lang: Lang) {
    let _ = CURRENT_LANG.set(lang);
}

/// Get the currently configured language (defaults to English).
pub fn lang() -> Lang {
    CURRENT_LANG.get().copied().unwrap_or(Lang::En)
}

/// Detect language from `MXSHELL_LANG`, then `LC_MESSAGES` / `LANG`.
pub fn detect_system_lang() -> Lang {
    std::env::var("MXSHELL_LANG")
        .ok()
        .and_then(|v| Lang::from_code(&v))
        .or_else(|| {
            std::env::var("LC_MESSAGES")
                .ok()
                .and_then(|v| Lang::from_code(&v))
        })
        .or_else(|| std::env::var("LANG").ok().and_then(|v| Lang::from_code(&v)))
        .unwrap_or(Lang::En)
}

/// Macro for defining translatable message functions.
/// Each function returns a `&'static str` based on the current language.
macro_rules! msg {
    ($name:ident, $en:expr, $es:expr) => {
        /// Returns a localized string for the current language.
        pub fn $name() -> &'static str {
            match lang() {
                Lang::En => $en,
                Lang::Es => $es,
            }
        }
    };
}

// ── General ──────────────────────────────────────────────────────

msg!(app_name, "mxShell", "mxShell");
msg!(
    app_about,
    "mxShell \u{2014} Inspect and maintain local mailboxes (mbox, MMDF, MH, maildir) safely.",
    "mxShell \u{2014} Inspecciona y mantiene buzones locales (mbox, MMDF, MH, maildir) de forma segura."
);
msg!(
    app_long_about,
    "mxShell \u{2014} Inspect and maintain local mailboxes.\nDetects the mailbox format, locks it the way mail clients do,\nand purges, appends or checkpoints without ever losing mail.",
    "mxShell \u{2014} Inspecciona y mantiene buzones locales.\nDetecta el formato del buz\u{f3}n, lo bloquea como hacen los clientes de correo,\ny purga, a\u{f1}ade o sincroniza sin perder nunca un mensaje."
);
msg!(
    app_after_help,
    "Configuration: ~/.config/mxshell/config.toml (override with MXSHELL_CONFIG)",
    "Configuraci\u{f3}n: ~/.config/mxshell/config.toml (cambiar con MXSHELL_CONFIG)"
);

// ── CLI help strings ─────────────────────────────────────────────

msg!(
    help_verbose,
    "Verbose logging (-v info, -vv debug, -vvv trace)",
    "Registro detallado (-v info, -vv debug, -vvv trace)"
);
msg!(
    help_lang,
    "Language (en, es). Defaults to system locale",
    "Idioma (en, es). Por defecto usa el idioma del sistema"
);
msg!(
    help_cmd_detect,
    "Print the mailbox type of each path",
    "Mostrar el tipo de buz\u{f3}n de cada ruta"
);
msg!(
    help_cmd_info,
    "Open a mailbox read-only and show its counters",
    "Abrir un buz\u{f3}n en solo lectura y mostrar sus contadores"
);
msg!(
    help_cmd_empty,
    "Tell whether a mailbox holds any message",
    "Indicar si un buz\u{f3}n contiene alg\u{fa}n mensaje"
);
msg!(
    help_cmd_check,
    "Check a mailbox for new mail",
    "Comprobar si hay correo nuevo en un buz\u{f3}n"
);
msg!(
    help_cmd_delete,
    "Delete messages by number and close the mailbox",
    "Borrar mensajes por n\u{fa}mero y cerrar el buz\u{f3}n"
);
msg!(
    help_cmd_append,
    "Append message files to a mailbox, creating it if needed",
    "A\u{f1}adir ficheros de mensaje a un buz\u{f3}n, cre\u{e1}ndolo si hace falta"
);
msg!(
    help_cmd_sync,
    "Write pending changes of a mailbox back to disk",
    "Escribir en disco los cambios pendientes de un buz\u{f3}n"
);
msg!(
    help_cmd_completions,
    "Generate shell completions",
    "Generar autocompletado para la shell"
);
msg!(
    help_cmd_manpage,
    "Generate a man page",
    "Generar p\u{e1}gina de manual"
);

// ── Confirmation questions ───────────────────────────────────────

msg!(
    q_remove_lock,
    "Lock count exceeded, remove lock for",
    "L\u{ed}mite de intentos superado, \u{bf}eliminar el bloqueo de"
);
msg!(
    q_catchup,
    "Mark all articles read?",
    "\u{bf}Marcar todos los art\u{ed}culos como le\u{ed}dos?"
);
msg!(
    q_move_read,
    "Move read messages to",
    "\u{bf}Mover los mensajes le\u{ed}dos a"
);
msg!(q_purge, "Purge", "\u{bf}Purgar");
msg!(
    q_purge_one_suffix,
    "deleted message?",
    "mensaje borrado?"
);
msg!(
    q_purge_many_suffix,
    "deleted messages?",
    "mensajes borrados?"
);

// ── Status notices ───────────────────────────────────────────────

msg!(msg_reading, "Reading", "Leyendo");
msg!(msg_writing, "Writing", "Escribiendo");
msg!(
    msg_unchanged,
    "Mailbox is unchanged.",
    "El buz\u{f3}n no ha cambiado."
);
msg!(
    msg_checkpointed,
    "Mailbox checkpointed.",
    "Buz\u{f3}n sincronizado."
);
msg!(
    msg_interrupted,
    "Reading was interrupted; the mailbox may be incomplete.",
    "La lectura se interrumpi\u{f3}; el buz\u{f3}n puede estar incompleto."
);
msg!(msg_new_mail, "New mail in this mailbox.", "Correo nuevo en este buz\u{f3}n.");
msg!(msg_no_new_mail, "No new mail.", "No hay correo nuevo.");
msg!(
    msg_reopened,
    "Mailbox was externally modified. Flags may be wrong.",
    "El buz\u{f3}n se modific\u{f3} externamente. Las marcas pueden ser incorrectas."
);
msg!(msg_kept, "kept", "conservados");
msg!(msg_moved, "moved", "movidos");
msg!(msg_deleted, "deleted", "borrados");
msg!(msg_empty, "empty", "vac\u{ed}o");
msg!(msg_not_empty, "not empty", "no vac\u{ed}o");
msg!(msg_not_a_mailbox, "not a mailbox", "no es un buz\u{f3}n");
msg!(msg_appending, "Appending", "A\u{f1}adiendo");
msg!(
    msg_moving,
    "Moving read messages to",
    "Moviendo los mensajes le\u{ed}dos a"
);
msg!(msg_appended, "Appended", "A\u{f1}adidos");
msg!(msg_aborted, "Aborted.", "Cancelado.");

// ── CLI labels ───────────────────────────────────────────────────

msg!(label_path, "Path", "Ruta");
msg!(label_type, "Type", "Tipo");
msg!(label_messages, "Messages", "Mensajes");
msg!(label_unread, "Unread", "No le\u{ed}dos");
msg!(label_new, "New", "Nuevos");
msg!(label_flagged, "Flagged", "Destacados");
msg!(label_deleted, "Deleted", "Borrados");
msg!(label_size, "Size", "Tama\u{f1}o");

// ── Errors ───────────────────────────────────────────────────────

msg!(
    err_file_not_found,
    "File not found",
    "Fichero no encontrado"
);
msg!(
    err_bad_message_number,
    "No such message number",
    "No existe el mensaje n\u{fa}mero"
);

// ── Composed messages ────────────────────────────────────────────

/// "Lock count exceeded, remove lock for PATH?"
pub fn ask_remove_lock(path: &str) -> String {
    format!("{} {path}?", q_remove_lock())
}

/// "Move read messages to TARGET?"
pub fn ask_move_read(target: &str) -> String {
    format!("{} {target}?", q_move_read())
}

/// "Moving read messages to TARGET..."
pub fn moving_to(target: &str) -> String {
    format!("{} {target}...", msg_moving())
}

/// "Purge N deleted message(s)?"
pub fn ask_purge(count: usize) -> String {
    let suffix = if count == 1 {
        q_purge_one_suffix()
    } else {
        q_purge_many_suffix()
    };
    format!("{} {count} {suffix}", q_purge())
}

/// "K kept, M moved, D deleted." (the moved part only when something moved)
pub fn close_summary(kept: usize, moved: usize, deleted: usize) -> String {
    if moved > 0 {
        format!(
            "{kept} {}, {moved} {}, {deleted} {}.",
            msg_kept(),
            msg_moved(),
            msg_deleted()
        )
    } else {
        format!("{kept} {}, {deleted} {}.", msg_kept(), msg_deleted())
    }
}
