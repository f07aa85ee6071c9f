//! Purpose: `lapis` CLI entry point over a directory-backed store.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Every command emits exactly one JSON value on stdout on success.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All document mutations go through `api::Collection` (session locks).
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod key_info_json;
mod store_paths;

use lapis::api::{Config, Error, ErrorKind, to_exit_code};
use store_paths::default_store_dir;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome { exit_code });
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint(clap_error_hint(&err)));
            }
        },
    };

    let store_dir = cli.dir.clone().unwrap_or_else(default_store_dir);
    let config = cli.config()?;

    command_dispatch::dispatch_command(cli.command, store_dir, config)
        .map_err(add_lock_hint)
        .map_err(add_corrupt_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(false)
        .try_init();
}

fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let replacement = arg.to_str().and_then(|value| match value {
                "---help" => Some("--help"),
                "---version" => Some("--version"),
                _ => None,
            });
            replacement.map(OsString::from).unwrap_or(arg)
        })
        .collect()
}

#[derive(Parser)]
#[command(
    name = "lapis",
    version,
    about = "Session-locked JSON documents in a local store directory",
    long_about = None,
    before_help = r#"Each key is a document. Loading it takes a session lock, so only one
process edits a key at a time; others wait and retry until the lock frees."#,
    after_help = r#"EXAMPLES
  $ lapis write players p1 '{"coins": 100}'
  $ lapis bump players p1 coins --by 5
  $ lapis read players p1
  $ lapis info players p1
  $ lapis remove players p1"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        help = "Store directory (default: ~/.lapis/stores)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(long, help = "Lock acquisition attempts before giving up")]
    load_attempts: Option<u32>,
    #[arg(long, help = "Delay between lock attempts in milliseconds")]
    load_retry_delay_ms: Option<u64>,
    #[arg(long, help = "Write attempts per save or close")]
    save_attempts: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn config(&self) -> Result<Config, Error> {
        let mut config = Config::default();
        if let Some(attempts) = self.load_attempts {
            config.load_attempts = attempts;
        }
        if let Some(delay_ms) = self.load_retry_delay_ms {
            config.load_retry_delay = Duration::from_millis(delay_ms);
        }
        if let Some(attempts) = self.save_attempts {
            config.save_attempts = attempts;
        }
        config
            .validate()
            .map_err(|err| err.with_hint("Attempt counts must be at least 1."))?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Print a document's data without taking its lock")]
    Read { store: String, key: String },
    #[command(about = "Replace a document's data (must be a JSON object)")]
    Write {
        store: String,
        key: String,
        #[arg(help = "JSON object, e.g. '{\"coins\": 1}'")]
        data: String,
        #[arg(long = "user-id", help = "Associate a user id with the key (repeatable)")]
        user_ids: Vec<u64>,
    },
    #[command(about = "Add to an integer field under the document lock")]
    Bump {
        store: String,
        key: String,
        field: String,
        #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
        by: i64,
        #[arg(long = "user-id", help = "Associate a user id with the key (repeatable)")]
        user_ids: Vec<u64>,
        #[arg(long, default_value_t = 0, help = "Keep the document open this long before closing")]
        hold_ms: u64,
    },
    #[command(about = "Print the stored record envelope and key metadata")]
    Info { store: String, key: String },
    #[command(about = "Delete a document once its lock can be taken")]
    Remove { store: String, key: String },
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::LockUnavailable => "document is locked".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        kind => format!("{kind:?}"),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(attempts) = err.attempts() {
        inner.insert("attempts".to_string(), json!(attempts));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(key) = err.key() {
        lines.push(format!("key: {key}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn add_lock_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::LockUnavailable || err.hint().is_some() {
        return err;
    }
    err.with_hint("Another process holds the document. Retry later or raise --load-attempts.")
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check directory permissions or use --dir to a writable location.",
        ),
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("Stored entry is not a lapis record. Inspect it with `lapis info` or remove it.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_LOG=debug and share command/context if it persists.",
    )
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);
    let Some(usage) = usage else {
        return "Try `lapis --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "lapis") else {
        return "Try `lapis --help`.".to_string();
    };
    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !token.starts_with('-') && !token.starts_with('<') && !token.starts_with('[')
        })
        .copied()
        .collect();
    if parts.is_empty() {
        return "Try `lapis --help`.".to_string();
    }
    format!("Try `lapis {} --help`.", parts.join(" "))
}

fn parse_inline_json(data: &str) -> Result<Value, Error> {
    serde_json::from_str(data).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid json")
            .with_hint("Provide a single JSON object (e.g. '{\"x\":1}').")
            .with_source(err)
    })
}
