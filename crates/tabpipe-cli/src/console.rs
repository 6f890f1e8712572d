//! Interactive control of the running session from a terminal.
//!
//! Commands arrive one per line on stdin; session changes are rendered to stderr.

use tabpipe_core::{SessionSnapshot, Settings, TabHandle};
use tabpipe_local::RelayHandle;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;

pub(crate) const HELP: &str =
    "commands: submit [note] | cancel | state | focus <tab> | set <setting> <value> | help";

/// Settings the `set` command may change while the proxy runs.
const SETTABLE: &str = "max_results, extract_delay_ms, extract_timeout_s, deadline_ms, grace_ms, auto_close, private_mode, engine_url";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConsoleCommand {
    Submit(Option<String>),
    Cancel,
    State,
    Focus(TabHandle),
    Set { key: String, value: String },
    Help,
}

/// `Ok(None)` for a blank line.
pub(crate) fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    let cmd = match word.to_ascii_lowercase().as_str() {
        "submit" | "s" => ConsoleCommand::Submit((!rest.is_empty()).then(|| rest.to_string())),
        "cancel" | "c" => ConsoleCommand::Cancel,
        "state" | "status" => ConsoleCommand::State,
        "focus" | "f" => {
            let id = rest.strip_prefix("tab:").unwrap_or(rest);
            let id: u64 = id
                .parse()
                .map_err(|_| format!("focus needs a tab number, got {rest:?}"))?;
            ConsoleCommand::Focus(TabHandle(id))
        }
        "set" => {
            let (key, value) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| format!("usage: set <setting> <value> ({SETTABLE})"))?;
            ConsoleCommand::Set {
                key: key.to_ascii_lowercase(),
                value: value.trim().to_string(),
            }
        }
        "help" | "?" => ConsoleCommand::Help,
        other => return Err(format!("unknown command {other:?}; {HELP}")),
    };
    Ok(Some(cmd))
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{key}: cannot use {value:?}"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(format!("{key}: expected on|off, got {value:?}")),
    }
}

/// Change one setting in place. Applies from the next search on.
pub(crate) fn apply_setting(settings: &mut Settings, key: &str, value: &str) -> Result<(), String> {
    match key {
        "max_results" => {
            let n: usize = parse_value(key, value)?;
            if n == 0 {
                return Err("max_results must be at least 1".to_string());
            }
            settings.max_results = n;
        }
        "extract_delay_ms" => settings.extract_delay_ms = parse_value(key, value)?,
        "extract_timeout_s" => settings.extract_timeout_s = parse_value(key, value)?,
        "deadline_ms" => settings.deadline_ms = parse_value(key, value)?,
        "grace_ms" => settings.grace_ms = parse_value(key, value)?,
        "auto_close" => settings.auto_close = parse_flag(key, value)?,
        "private_mode" => settings.private_mode = parse_flag(key, value)?,
        "engine_url" => {
            if !value.contains("{query}") || reqwest::Url::parse(value).is_err() {
                return Err("engine_url must be an absolute URL containing {query}".to_string());
            }
            settings.engine_url = value.to_string();
        }
        other => return Err(format!("{other} cannot be set here; one of: {SETTABLE}")),
    }
    Ok(())
}

/// Multi-line rendering of a snapshot for the `state` command.
pub(crate) fn render_state(s: &SessionSnapshot) -> String {
    let mut out = s.status_line();
    for site in &s.sites {
        let tab = site
            .tab
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "\n  {:<8} {:<8} {}",
            tab,
            site.status.label(),
            site.url
        ));
    }
    if s.can_submit() {
        out.push_str("\n  (submit available)");
    }
    out
}

async fn apply(
    relay: &RelayHandle,
    settings: &mut Settings,
    cmd: ConsoleCommand,
) -> anyhow::Result<()> {
    match cmd {
        ConsoleCommand::Set { key, value } => {
            let mut next = settings.clone();
            match apply_setting(&mut next, &key, &value) {
                Ok(()) => {
                    relay.update_settings(next.clone())?;
                    *settings = next;
                    eprintln!("[tabpipe] {key} = {value} (from the next search)");
                }
                Err(msg) => eprintln!("[tabpipe] {msg}"),
            }
        }
        ConsoleCommand::Submit(note) => relay.submit(note)?,
        ConsoleCommand::Cancel => relay.cancel()?,
        ConsoleCommand::Focus(tab) => relay.focus(tab)?,
        ConsoleCommand::State => eprintln!("{}", render_state(&relay.get_state().await?)),
        ConsoleCommand::Help => eprintln!("{HELP}"),
    }
    Ok(())
}

/// Read commands from stdin until EOF. `settings` is what the session was started with.
pub(crate) async fn run_stdin(relay: RelayHandle, mut settings: Settings) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "console input closed");
                break;
            }
        };
        match parse_command(&line) {
            Ok(Some(cmd)) => {
                if let Err(e) = apply(&relay, &mut settings, cmd).await {
                    eprintln!("[tabpipe] {e}");
                    break;
                }
            }
            Ok(None) => {}
            Err(msg) => eprintln!("[tabpipe] {msg}"),
        }
    }
}

/// Print a status line to stderr whenever it changes.
pub(crate) async fn watch_state(mut rx: watch::Receiver<SessionSnapshot>) {
    let mut last = String::new();
    while rx.changed().await.is_ok() {
        let line = rx.borrow_and_update().status_line();
        if line != last {
            eprintln!("[tabpipe] {line}");
            last = line;
        }
    }
}
