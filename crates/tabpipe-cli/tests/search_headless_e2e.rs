use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::Html;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::time::Duration;

const ARTICLE: &str = "Tokio is an asynchronous runtime for the Rust programming language. \
    It provides the building blocks needed for writing network applications.";

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn fixture() -> Router {
    Router::new()
        .route(
            "/html/",
            get(|| async {
                Html(
                    r#"<html><body>
                      <a class="result__a" href="/page/good">Good</a>
                      <a class="result__a" href="/page/challenge">Challenge</a>
                    </body></html>"#,
                )
            }),
        )
        .route(
            "/page/:name",
            get(|Path(name): Path<String>| async move {
                if name == "good" {
                    (
                        StatusCode::OK,
                        Html(format!(
                            "<html><head><title>Tokio</title></head><body><article>{ARTICLE}</article></body></html>"
                        )),
                    )
                } else {
                    (
                        StatusCode::OK,
                        Html("<html><head><title>Just a moment...</title></head><body>Checking</body></html>".to_string()),
                    )
                }
            }),
        )
}

fn tabpipe() -> tokio::process::Command {
    let bin = assert_cmd::cargo::cargo_bin!("tabpipe");
    let mut cmd = tokio::process::Command::new(bin);
    for k in ["TABPIPE_ENV_FILE", "TABPIPE_SETTINGS", "TABPIPE_AUTO_CLOSE"] {
        cmd.env_remove(k);
    }
    cmd.env("TABPIPE_LOG", "warn");
    cmd
}

#[tokio::test]
async fn search_command_runs_a_headless_session_end_to_end() {
    let addr = serve(fixture()).await;

    let out = tokio::time::timeout(
        Duration::from_secs(60),
        tabpipe()
            .args(["search", "tokio runtime", "--note", "be brief"])
            .env("TABPIPE_ENGINE_URL", format!("http://{addr}/html/?q={{query}}"))
            .env("TABPIPE_EXTRACT_DELAY_MS", "0")
            .output(),
    )
    .await
    .expect("search finished in time")
    .expect("run tabpipe search");
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("parse search json");
    assert_eq!(v["kind"].as_str(), Some("search"));
    assert_eq!(v["ok"].as_bool(), Some(true));
    assert_eq!(v["query"].as_str(), Some("tokio runtime"));
    assert_eq!(v["user_note"].as_str(), Some("be brief"));

    let results = v["results"].as_array().expect("results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["title"].as_str(), Some("Tokio"));
    assert_eq!(results[0]["url"], format!("http://{addr}/page/good"));
    assert!(results[0]["content"]
        .as_str()
        .unwrap()
        .starts_with("Tokio is an asynchronous runtime"));

    let sites = v["sites"].as_array().expect("sites");
    assert_eq!(sites[0]["status"].as_str(), Some("loaded"));
    assert_eq!(sites[1]["status"].as_str(), Some("blocked"));
    assert!(v["warnings"]
        .as_array()
        .unwrap()
        .iter()
        .any(|w| w == "sites_blocked"));
    assert!(v["warning_hints"]["sites_blocked"].is_string());
}

#[tokio::test]
async fn search_text_output_matches_tool_message_format() {
    let addr = serve(fixture()).await;
    let out = tabpipe()
        .args(["search", "tokio", "--output", "text"])
        .env("TABPIPE_ENGINE_URL", format!("http://{addr}/html/?q={{query}}"))
        .env("TABPIPE_EXTRACT_DELAY_MS", "0")
        .output()
        .await
        .expect("run tabpipe search");
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.starts_with("[1] Tokio\nURL: http://"), "{text}");
    assert!(text.contains(ARTICLE.split_whitespace().next().unwrap()));
}

#[tokio::test]
async fn search_times_out_with_marker_result() {
    // Engine that never answers within the tool timeout.
    let app = Router::new().route(
        "/slow",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Html("")
        }),
    );
    let addr = serve(app).await;
    let out = tabpipe()
        .args(["search", "anything", "--tool-timeout-ms", "300"])
        .env("TABPIPE_ENGINE_URL", format!("http://{addr}/slow?q={{query}}"))
        .output()
        .await
        .expect("run tabpipe search");
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["ok"].as_bool(), Some(false));
    assert_eq!(v["results"][0]["title"].as_str(), Some("Timeout"));
    assert_eq!(v["warnings"][0].as_str(), Some("search_timed_out"));
}

#[tokio::test]
async fn unreachable_engine_cancels_with_a_warning() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let out = tokio::time::timeout(
        Duration::from_secs(30),
        tabpipe()
            .args(["search", "anything"])
            .env("TABPIPE_ENGINE_URL", format!("http://{dead}/?q={{query}}"))
            .output(),
    )
    .await
    .expect("search gave up before the tool timeout")
    .expect("run tabpipe search");
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["ok"].as_bool(), Some(false));
    assert_eq!(v["results"][0]["title"].as_str(), Some("Canceled"));
    assert_eq!(v["warnings"][0].as_str(), Some("engine_unreachable"));
    assert!(v["warning_hints"]["engine_unreachable"].is_string());
}

#[tokio::test]
async fn empty_query_is_invalid_params() {
    let out = tabpipe()
        .args(["search", "   "])
        .output()
        .await
        .expect("run tabpipe search");
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["ok"].as_bool(), Some(false));
    assert_eq!(v["error"]["code"].as_str(), Some("invalid_params"));
    assert_eq!(v["error"]["retryable"].as_bool(), Some(false));
}
