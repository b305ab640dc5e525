//! Liveness page and the pause switch for update handling.

use axum::{
    extract::State,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub struct StatusBoard {
    started_at: DateTime<Utc>,
    running: AtomicBool,
    updates: AtomicU64,
    bot_username: String,
    required_channel: String,
    join_timeout_secs: u64,
}

impl StatusBoard {
    pub fn new(bot_username: &str, required_channel: &str, join_timeout_secs: u64) -> Self {
        Self {
            started_at: Utc::now(),
            running: AtomicBool::new(true),
            updates: AtomicU64::new(0),
            bot_username: bot_username.to_string(),
            required_channel: required_channel.to_string(),
            join_timeout_secs,
        }
    }

    /// Updates are dropped while this is false.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, on: bool) {
        let was = self.running.swap(on, Ordering::SeqCst);
        if was != on {
            info!("update handling {}", if on { "resumed" } else { "paused" });
        }
    }

    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

async fn index(State(board): State<Arc<StatusBoard>>) -> Html<String> {
    let status = if board.is_running() {
        "<span class=\"on\">Running</span>"
    } else {
        "<span class=\"off\">Paused</span>"
    };
    Html(format!(
        "<!doctype html>
<html>
<head><meta charset=\"utf-8\"><title>Apex Guard</title>
<style>body{{font-family:sans-serif;margin:2em}} .on{{color:#2a2}} .off{{color:#c22}}</style>
</head>
<body>
<h1>Apex Guard</h1>
<p>Status: {status}</p>
<ul>
<li>Bot: @{bot}</li>
<li>Required channel: @{channel}</li>
<li>Join verification wait: {timeout} seconds</li>
<li>Uptime: {uptime} seconds</li>
<li>Updates handled: {updates}</li>
</ul>
<form method=\"post\" action=\"/start_bot\"><button>Start</button></form>
<form method=\"post\" action=\"/stop_bot\"><button>Stop</button></form>
</body>
</html>",
        bot = crate::texts::escape(&board.bot_username),
        channel = crate::texts::escape(&board.required_channel),
        timeout = board.join_timeout_secs,
        uptime = board.uptime_secs(),
        updates = board.updates.load(Ordering::Relaxed),
    ))
}

async fn status(State(board): State<Arc<StatusBoard>>) -> Json<Value> {
    Json(json!({
        "running": board.is_running(),
        "uptime_secs": board.uptime_secs(),
        "updates": board.updates.load(Ordering::Relaxed),
    }))
}

async fn ping() -> Json<Value> {
    Json(json!({
        "status": "alive",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn start_bot(State(board): State<Arc<StatusBoard>>) -> Json<Value> {
    board.set_running(true);
    Json(json!({ "success": true }))
}

async fn stop_bot(State(board): State<Arc<StatusBoard>>) -> Json<Value> {
    board.set_running(false);
    Json(json!({ "success": true }))
}

pub fn router(board: Arc<StatusBoard>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/ping", get(ping))
        .route("/start_bot", post(start_bot))
        .route("/stop_bot", post(stop_bot))
        .layer(TraceLayer::new_for_http())
        .with_state(board)
}

/// Long-running; spawn it. A bind failure is logged and ends the task.
pub async fn serve(bind: String, board: Arc<StatusBoard>) {
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(l) => l,
        Err(e) => {
            error!("status page: failed to bind {}: {}", bind, e);
            return;
        }
    };
    info!("status page listening on {}", bind);
    if let Err(e) = axum::serve(listener, router(board)).await {
        error!("status page error: {}", e);
    }
}
