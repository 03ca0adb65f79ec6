//! CoreGW session enforcement daemon.
//!
//! Tracks granted quotas and installed policy rules per subscriber
//! session, reports usage to the policy/charging controller, and
//! programs the user-plane pipeline accordingly.
//!
//! # Architecture
//!
//! - Session state and credit accounting (`session_state`, `credit`,
//!   `charging_grant`, `monitor`)
//! - Durable storage with merge-applied update criteria (`stored`,
//!   `session_store`)
//! - Orchestration on a single reactor (`enforcer`, `event`, `timer`)
//! - Collaborator interfaces (`pipelined`, `reporter`, `directoryd`,
//!   `access`)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

mod access;
mod charging_grant;
mod config;
mod credit;
mod directoryd;
mod enforcer;
mod error;
mod event;
mod monitor;
mod pipelined;
#[cfg(test)]
mod property_tests;
mod reporter;
mod rule_store;
mod session_state;
mod session_store;
mod stored;
mod timer;

use access::{LoggingAaaClient, LoggingSpgwClient};
use config::{SessiondConfig, DEFAULT_CONFIG_PATH};
use directoryd::LoggingDirectorydClient;
use enforcer::LocalEnforcer;
use pipelined::LoggingPipelinedClient;
use reporter::LoggingSessionReporter;
use rule_store::StaticRuleStore;
use session_store::SessionStore;
use timer::now_epoch;

/// Global shutdown flag
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("CoreGW sessiond v{} starting...", env!("CARGO_PKG_VERSION"));

    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        SHUTDOWN.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let config_path =
        std::env::var("SESSIOND_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = SessiondConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    log::info!(
        "Loaded configuration from {config_path} (force_termination={}ms, threshold={})",
        config.session_force_termination_timeout_ms,
        config.usage_reporting_threshold
    );

    let rule_store = Arc::new(StaticRuleStore::new());
    for rule in &config.static_rules {
        rule_store.insert_rule(rule.clone());
    }
    log::info!("Rule store initialized with {} static rules", config.static_rules.len());

    let session_store = Arc::new(SessionStore::new(rule_store.clone()));
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let enforcer = LocalEnforcer::new(
        Arc::new(LoggingSessionReporter),
        rule_store,
        session_store,
        Arc::new(LoggingPipelinedClient),
        Arc::new(LoggingDirectorydClient),
        Arc::new(LoggingSpgwClient),
        Arc::new(LoggingAaaClient),
        &config,
        event_tx,
    );

    // reconcile rule lifetimes and re-push pipeline state on startup
    enforcer.sync_sessions_on_restart(now_epoch());
    if let Err(e) = enforcer.setup(now_epoch() as u64) {
        log::warn!("Pipeline setup failed, will re-push on next restart: {e}");
    }
    log::info!("CoreGW sessiond ready");

    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(config.poll_interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if SHUTDOWN.load(Ordering::SeqCst) {
                    break;
                }
                enforcer.tick();
            }
            Some(event) = event_rx.recv() => {
                enforcer.handle_event(event);
            }
        }
    }

    log::info!("Shutting down...");
    log::info!("CoreGW sessiond stopped");
    Ok(())
}
