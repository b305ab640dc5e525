mod admission;
mod ai;
mod clock;
mod commands;
mod config;
mod error;
mod handlers;
mod moderation;
mod platform;
mod scheduler;
mod status;
mod store;
mod texts;

use crate::admission::AdmissionGate;
use crate::ai::{GeminiResponder, Responder, StubResponder};
use crate::clock::SystemClock;
use crate::config::{apply_env, load_config, validate_config};
use crate::handlers::{schema, App};
use crate::moderation::{Ledger, LedgerStores};
use crate::platform::{ChatPlatform, TelegramPlatform};
use crate::scheduler::TokioScheduler;
use crate::status::StatusBoard;
use crate::store::MemoryTable;
use anyhow::{Context, Result};
use std::{path::PathBuf, sync::Arc, time::Duration};
use teloxide::{dptree, prelude::*, requests::Request};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HOUSEKEEPING_SECS: u64 = 180;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = parse_config_arg(&args).unwrap_or_else(|| PathBuf::from("config.yaml"));

    let mut cfg = load_config(&config_path)?;
    apply_env(&mut cfg, |k| std::env::var(k).ok())?;
    validate_config(&cfg)?;

    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::new(v),
        _ => EnvFilter::new(cfg.bot.log_level.clone().unwrap_or_else(|| "info".into())),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (shutdown_tx, _shutdown_rx0) = broadcast::channel::<()>(8);

    let bot = Bot::new(cfg.bot.token.clone());
    let me = bot.get_me().send().await.context("get_me")?;
    let bot_username = me.user.username.clone().unwrap_or_else(|| "bot".into());

    let platform: Arc<dyn ChatPlatform> = Arc::new(TelegramPlatform::new(bot.clone()));
    let responder: Arc<dyn Responder> = match cfg.ai.usable_key() {
        Some(key) => {
            info!("ai backend: {}", cfg.ai.model);
            Arc::new(GeminiResponder::new(&cfg.ai, key, &cfg.bot.persona_name)?)
        }
        None => {
            warn!("no ai key configured, using offline replies");
            Arc::new(StubResponder)
        }
    };
    let clock = Arc::new(SystemClock);
    let scheduler = Arc::new(TokioScheduler);

    let gate = AdmissionGate::new(
        &cfg.admission,
        platform.clone(),
        scheduler.clone(),
        clock.clone(),
        MemoryTable::shared(),
    )?;
    let ledger = Arc::new(Ledger::new(
        cfg.moderation.clone(),
        platform.clone(),
        responder.clone(),
        clock,
        scheduler,
        LedgerStores::in_memory(),
    ));
    let board = Arc::new(StatusBoard::new(
        &bot_username,
        cfg.admission.channel_name(),
        cfg.admission.join_timeout_secs,
    ));

    let h_status = cfg.status.enabled.then(|| {
        let bind = cfg.status.bind.clone();
        let board = board.clone();
        tokio::spawn(status::serve(bind, board))
    });

    let ledger_admin = ledger.clone();
    let mut shutdown_rx_admin = shutdown_tx.subscribe();
    let h_admin = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(HOUSEKEEPING_SECS));
        loop {
            tokio::select! {
                _ = shutdown_rx_admin.recv() => { break; }
                _ = ticker.tick() => {
                    ledger_admin.refresh_admins().await;
                    ledger_admin.sweep();
                }
            }
        }
    });

    let app = Arc::new(App::new(
        Arc::new(gate),
        ledger,
        responder,
        platform,
        board,
        &bot_username,
    )?);

    info!(
        "Start polling as @{} (required channel @{}, wait {}s)",
        bot_username,
        cfg.admission.channel_name(),
        cfg.admission.join_timeout_secs
    );

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![app])
        .default_handler(|upd| async move {
            let _ = upd;
        })
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    let _ = shutdown_tx.send(());
    let _ = h_admin.await;
    if let Some(h) = h_status {
        h.abort();
    }

    Ok(())
}

fn parse_config_arg(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_flag_takes_next_argument() {
        let args = vec!["--config".to_string(), "/etc/apex.yaml".to_string()];
        assert_eq!(parse_config_arg(&args), Some(PathBuf::from("/etc/apex.yaml")));
        assert_eq!(parse_config_arg(&["--config".to_string()]), None);
        assert_eq!(parse_config_arg(&[]), None);
    }
}
