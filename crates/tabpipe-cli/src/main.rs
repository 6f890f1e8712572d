use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabpipe_core::{SearchResult, SessionStatus, Settings};
use tabpipe_local::interceptor::format_tool_results;
use tabpipe_local::manifest::SEARCH_TOOL;
use tabpipe_local::{HeadlessSession, Interceptor, ReqwestUpstream, ToolManifest};

mod config;
mod console;
mod envelope;
mod logging;
mod proxy;

use config::SettingsArgs;
use envelope::{add_envelope_fields, error_obj, ErrorCode};

#[derive(Parser, Debug)]
#[command(name = "tabpipe")]
#[command(about = "Web-search tool for OpenAI-style chat clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the intercepting proxy in front of an upstream chat server.
    Proxy(ProxyCmd),
    /// Run one headless search, submit it when ready and print the results (json).
    Search(SearchCmd),
    /// Print the tool manifest injected into chat requests (json).
    Tools(ToolsCmd),
    /// Diagnose configuration issues (json).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct ProxyCmd {
    /// Address to listen on. Use port 0 for an ephemeral port (printed on stdout).
    #[arg(long, env = "TABPIPE_LISTEN", default_value = "127.0.0.1:8787")]
    listen: String,
    /// Upstream base URL, e.g. http://127.0.0.1:11434
    #[arg(long, env = "TABPIPE_UPSTREAM")]
    upstream: String,
    /// Tool manifest (JSON array) to inject instead of the bundled one.
    #[arg(long, env = "TABPIPE_TOOLS")]
    tools: Option<std::path::PathBuf>,
    /// Read session commands (submit/cancel/state/focus) from stdin.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    console: bool,
    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(clap::Args, Debug)]
struct SearchCmd {
    query: String,
    /// Note passed along with the submitted results.
    #[arg(long)]
    note: Option<String>,
    /// Render session changes on stderr while the search runs.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    watch: bool,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(clap::Args, Debug)]
struct ToolsCmd {
    #[arg(long, env = "TABPIPE_TOOLS")]
    tools: Option<std::path::PathBuf>,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
    /// Probe the search engine with a test query (network).
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    check_engine: bool,
    /// Timeout for the engine probe (ms).
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,
    #[arg(long, env = "TABPIPE_TOOLS")]
    tools: Option<std::path::PathBuf>,
    #[command(flatten)]
    settings: SettingsArgs,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

fn load_manifest(path: Option<&std::path::Path>) -> Result<ToolManifest> {
    Ok(match path {
        Some(p) => ToolManifest::from_file(p)?,
        None => ToolManifest::default(),
    })
}

async fn run_proxy(args: ProxyCmd) -> Result<()> {
    let settings = args.settings.resolve()?;
    let manifest = load_manifest(args.tools.as_deref())?;
    reqwest::Url::parse(&args.upstream)
        .map_err(|e| anyhow::anyhow!("invalid --upstream {}: {e}", args.upstream))?;

    let session = HeadlessSession::spawn(settings.clone())?;
    let upstream = ReqwestUpstream::new(tabpipe_local::upstream_client()?);
    let interceptor = Interceptor::new(
        Arc::new(upstream),
        Arc::new(session.bridge.clone()),
        manifest,
        settings.url_patterns.clone(),
    );
    let state = Arc::new(proxy::ProxyState {
        interceptor,
        upstream_base: args.upstream.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, upstream = %args.upstream, "proxy listening");
    println!(
        "{}",
        serde_json::json!({
            "schema_version": envelope::SCHEMA_VERSION,
            "kind": "listening",
            "ok": true,
            "addr": addr.to_string(),
            "upstream": args.upstream,
        })
    );
    std::io::stdout().flush()?;

    tokio::spawn(console::watch_state(session.relay.subscribe()));
    if args.console {
        eprintln!("[tabpipe] {}", console::HELP);
        tokio::spawn(console::run_stdin(session.relay.clone(), settings.clone()));
    }

    axum::serve(listener, proxy::router(state)).await?;
    Ok(())
}

async fn run_search(args: SearchCmd) -> Result<()> {
    let t0 = Instant::now();
    let query = args.query.trim().to_string();
    let mut payload = if query.is_empty() {
        serde_json::json!({
            "ok": false,
            "query": query,
            "results": [],
            "error": error_obj(ErrorCode::InvalidParams, "query must be non-empty", "Pass a search query."),
        })
    } else {
        let settings = args.settings.resolve()?;
        let session = HeadlessSession::spawn(settings)?;
        if args.watch {
            tokio::spawn(console::watch_state(session.relay.subscribe()));
        }

        // Submit as soon as the session is ready; give up on a failed engine window.
        let submitter = {
            let relay = session.relay.clone();
            let mut rx = relay.subscribe();
            let note = args.note.clone();
            tokio::spawn(async move {
                let status = rx
                    .wait_for(|s| matches!(s.status, SessionStatus::Ready | SessionStatus::Error))
                    .await
                    .ok()?
                    .status;
                let _ = match status {
                    SessionStatus::Ready => relay.submit(note),
                    _ => relay.cancel(),
                };
                Some(status)
            })
        };

        let result = tabpipe_core::ToolSearch::search(&session.bridge, &query).await;
        // Only the submitter cancels here, so a canceled outcome means it already ran.
        let canceled = matches!(&result, Ok(o) if o.results == [SearchResult::canceled()]);
        let engine_failed = if canceled {
            submitter.await.ok().flatten() == Some(SessionStatus::Error)
        } else {
            submitter.abort();
            false
        };
        let snapshot = session.relay.get_state().await.unwrap_or_default();

        match result {
            Ok(outcome) => {
                let mut warnings = envelope::outcome_warnings(&outcome, Some(&snapshot));
                if engine_failed {
                    warnings.insert(0, "engine_unreachable");
                }
                if args.output.eq_ignore_ascii_case("text") {
                    print!("{}", format_tool_results(&outcome));
                    return Ok(());
                }
                serde_json::json!({
                    "ok": envelope::outcome_ok(&outcome),
                    "query": query,
                    "results": outcome.results,
                    "user_note": outcome.user_note,
                    "sites": snapshot.sites,
                    "warnings": warnings,
                    "warning_hints": envelope::warning_hints_from(&warnings),
                })
            }
            Err(e) => serde_json::json!({
                "ok": false,
                "query": query,
                "results": [],
                "error": error_obj(ErrorCode::from(&e), &e, "The session ended unexpectedly; rerun with TABPIPE_LOG=debug."),
            }),
        }
    };
    add_envelope_fields(&mut payload, "search", t0.elapsed().as_millis());
    println!("{payload}");
    Ok(())
}

fn run_tools(args: ToolsCmd) -> Result<()> {
    let manifest = load_manifest(args.tools.as_deref())?;
    let mut payload = serde_json::json!({
        "ok": manifest.declares(SEARCH_TOOL),
        "names": manifest.tool_names(),
        "tools": manifest.as_value(),
    });
    add_envelope_fields(&mut payload, "tools", 0);
    println!("{payload}");
    Ok(())
}

async fn run_doctor(args: DoctorCmd) -> Result<()> {
    let t0 = Instant::now();
    let mut checks: Vec<serde_json::Value> = Vec::new();

    let (settings, settings_err) = match args.settings.resolve() {
        Ok(s) => (s, None),
        Err(e) => (Settings::default(), Some(format!("{e:#}"))),
    };
    checks.push(serde_json::json!({
        "name": "settings_resolved",
        "ok": settings_err.is_none(),
        "message": settings_err.clone().unwrap_or_else(|| "settings resolved".to_string()),
        "hint": if settings_err.is_some() { "Fix the settings file (TABPIPE_SETTINGS) or unset it." } else { "" },
    }));

    let bad_patterns: Vec<&String> = settings
        .url_patterns
        .iter()
        .filter(|p| tabpipe_core::settings::pattern_to_regex(p).is_none())
        .collect();
    checks.push(serde_json::json!({
        "name": "url_patterns_valid",
        "ok": bad_patterns.is_empty() && !settings.url_patterns.is_empty(),
        "message": if settings.url_patterns.is_empty() {
            "no url patterns: interception is never active".to_string()
        } else {
            format!("{} pattern(s), {} invalid", settings.url_patterns.len(), bad_patterns.len())
        },
        "hint": if bad_patterns.is_empty() && !settings.url_patterns.is_empty() { "" } else { "Set TABPIPE_URL_PATTERNS to comma-separated patterns like http://localhost:*/*" },
    }));

    let probe_url = settings.engine_url_for("tabpipe doctor");
    let engine_url_ok = reqwest::Url::parse(&probe_url).is_ok();
    checks.push(serde_json::json!({
        "name": "engine_url_valid",
        "ok": engine_url_ok,
        "message": if engine_url_ok { "engine url parses" } else { "engine url does not parse" },
        "hint": if engine_url_ok { "" } else { "Set TABPIPE_ENGINE_URL to an absolute URL containing {query}." },
    }));

    let manifest = load_manifest(args.tools.as_deref());
    let manifest_ok = manifest.as_ref().is_ok_and(|m| m.declares(SEARCH_TOOL));
    checks.push(serde_json::json!({
        "name": "tools_manifest",
        "ok": manifest_ok,
        "message": match &manifest {
            Ok(m) => format!("tools: {}", m.tool_names().join(",")),
            Err(e) => e.to_string(),
        },
        "hint": if manifest_ok { "".to_string() } else { format!("The manifest must be a JSON array declaring `{SEARCH_TOOL}`.") },
    }));

    let mut engine_check = serde_json::json!({
        "name": "engine_reachable",
        "ok": true,
        "skipped": !args.check_engine,
        "message": "engine probe skipped",
        "elapsed_ms": serde_json::Value::Null,
        "error": serde_json::Value::Null,
    });
    if args.check_engine && engine_url_ok {
        let probe_t0 = Instant::now();
        let client = tabpipe_local::page_client()?;
        let res = tokio::time::timeout(
            Duration::from_millis(args.timeout_ms),
            client.get(&probe_url).send(),
        )
        .await;
        engine_check["elapsed_ms"] = serde_json::json!(probe_t0.elapsed().as_millis());
        let (ok, message) = match res {
            Ok(Ok(r)) if r.status().is_success() => (true, format!("engine answered {}", r.status())),
            Ok(Ok(r)) => (false, format!("engine answered {}", r.status())),
            Ok(Err(e)) => (false, e.to_string()),
            Err(_) => (false, format!("engine probe timed out after {}ms", args.timeout_ms)),
        };
        engine_check["ok"] = serde_json::json!(ok);
        engine_check["message"] = serde_json::json!(message);
        if !ok {
            engine_check["error"] = error_obj(
                ErrorCode::HostFailed,
                &message,
                "Check network access or point TABPIPE_ENGINE_URL at a reachable engine.",
            );
        }
    } else if args.check_engine {
        engine_check["ok"] = serde_json::json!(false);
        engine_check["message"] = serde_json::json!("engine url is invalid");
    }
    checks.push(engine_check);

    let ok = checks.iter().all(|c| c["ok"].as_bool().unwrap_or(false));
    let mut payload = serde_json::json!({
        "ok": ok,
        "name": "tabpipe",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": {
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
        "configured": {
            "settings_file": args.settings.settings_file.is_some(),
            "engine_url": settings.engine_url,
            "max_results": settings.max_results,
            "auto_close": settings.auto_close,
            "url_patterns": settings.url_patterns,
        },
        "checks": checks,
    });
    add_envelope_fields(&mut payload, "doctor", t0.elapsed().as_millis());

    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            println!("tabpipe {} (ok={})", env!("CARGO_PKG_VERSION"), ok);
            println!("engine_url: {}", settings.engine_url);
            println!("checks:");
            if let Some(arr) = payload["checks"].as_array() {
                for c in arr {
                    let name = c["name"].as_str().unwrap_or("?");
                    let ok = c["ok"].as_bool().unwrap_or(false);
                    let skipped = c["skipped"].as_bool().unwrap_or(false);
                    if skipped {
                        println!("- {}: skipped", name);
                    } else {
                        println!("- {}: {}", name, if ok { "ok" } else { "fail" });
                    }
                }
            }
        }
        _ => println!("{payload}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    config::load_env_file();
    logging::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Proxy(args) => run_proxy(args).await?,
        Commands::Search(args) => run_search(args).await?,
        Commands::Tools(args) => run_tools(args)?,
        Commands::Doctor(args) => run_doctor(args).await?,
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": envelope::SCHEMA_VERSION,
                "kind": "version",
                "ok": true,
                "name": "tabpipe",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("tabpipe {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{}", v),
            }
        }
    }
    Ok(())
}
