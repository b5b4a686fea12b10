//! Start the unlist daemon process.

use crate::broker::registry::{default_definitions_dir, BrokerRegistry};
use crate::broker::updater::BrokerUpdater;
use crate::cli::output;
use crate::config::EngineConfig;
use crate::driver::chromium::ChromiumDriver;
use crate::driver::{Driver, NoopDriver};
use crate::events::{EngineEvent, EventBus};
use crate::job::JobRunner;
use crate::scheduler::Scheduler;
use crate::services::{
    CaptchaSolver, EmailVerifier, HttpCaptchaSolver, HttpEmailVerifier, NoopCaptchaSolver,
    NoopEmailVerifier,
};
use crate::vault::Vault;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

/// PID file location, overridable with `UNLIST_PID_FILE`.
pub fn pid_file_path() -> PathBuf {
    if let Ok(custom) = std::env::var("UNLIST_PID_FILE") {
        if !custom.trim().is_empty() {
            return PathBuf::from(custom);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".unlist/unlist.pid")
}

/// Default vault location, overridable with `UNLIST_DB` or `--db`.
pub fn default_vault_path() -> PathBuf {
    if let Ok(custom) = std::env::var("UNLIST_DB") {
        if !custom.trim().is_empty() {
            return PathBuf::from(custom);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".unlist")
        .join("vault.db")
}

/// Check if unlist is already running. Returns the PID if so.
pub fn check_already_running() -> Option<i32> {
    let pid_path = pid_file_path();
    if !pid_path.exists() {
        return None;
    }
    let pid_str = std::fs::read_to_string(&pid_path).ok()?;
    let pid: i32 = pid_str.trim().parse().ok()?;

    #[cfg(unix)]
    {
        let output = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output();
        if matches!(output, Ok(o) if o.status.success()) {
            return Some(pid);
        }
    }

    // Stale PID file — clean up
    let _ = std::fs::remove_file(&pid_path);
    None
}

/// Everything the scheduler needs, wired together.
pub struct Engine {
    pub scheduler: Scheduler,
    pub bus: Arc<EventBus>,
    pub cancel: Arc<AtomicBool>,
}

/// Assemble vault, driver, services, runner, updater, and scheduler.
pub async fn build_engine(brokers_dir: Option<&str>, db: Option<&str>) -> Result<Engine> {
    let vault_path = db.map(PathBuf::from).unwrap_or_else(default_vault_path);
    let vault = Arc::new(Vault::open(&vault_path)?);

    let definitions_dir = brokers_dir
        .map(PathBuf::from)
        .unwrap_or_else(default_definitions_dir);
    let registry = BrokerRegistry::new(definitions_dir);
    let updater = Arc::new(BrokerUpdater::new(
        Arc::clone(&vault),
        registry,
        env!("CARGO_PKG_VERSION"),
    ));

    let driver: Arc<dyn Driver> = match ChromiumDriver::new().await {
        Ok(driver) => {
            info!("Chromium driver initialized");
            Arc::new(driver)
        }
        Err(e) => {
            warn!("failed to initialize Chromium: {e:#}");
            warn!("running without a browser; jobs will fail until one is installed");
            Arc::new(NoopDriver)
        }
    };

    let captcha: Arc<dyn CaptchaSolver> = match std::env::var("UNLIST_CAPTCHA_SERVICE_URL") {
        Ok(url) if !url.trim().is_empty() => Arc::new(HttpCaptchaSolver::new(&url)),
        _ => {
            warn!("no captcha service configured; captcha brokers will fail");
            Arc::new(NoopCaptchaSolver)
        }
    };
    let email: Arc<dyn EmailVerifier> = match std::env::var("UNLIST_EMAIL_SERVICE_URL") {
        Ok(url) if !url.trim().is_empty() => Arc::new(HttpEmailVerifier::new(&url)),
        _ => {
            warn!("no email service configured; email-confirmation brokers will fail");
            Arc::new(NoopEmailVerifier)
        }
    };

    let config = EngineConfig::from_env();
    let cancel = Arc::new(AtomicBool::new(false));
    let runner = Arc::new(JobRunner::new(
        config.clone(),
        captcha,
        email,
        Arc::clone(&cancel),
    ));
    let bus = Arc::new(EventBus::new(256));
    let scheduler = Scheduler::new(vault, driver, runner, updater, Arc::clone(&bus), config);

    Ok(Engine {
        scheduler,
        bus,
        cancel,
    })
}

/// Initialize the tracing subscriber for long-running commands.
pub fn init_tracing() {
    let default_level = if std::env::var("UNLIST_VERBOSE").map(|v| v == "1").unwrap_or(false) {
        "unlist=debug"
    } else {
        "unlist=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse().expect("static directive parses")),
        )
        .init();
}

/// Start the unlist daemon: write PID, run the scheduler until signaled.
pub async fn run(brokers_dir: Option<&str>, db: Option<&str>) -> Result<()> {
    if let Some(pid) = check_already_running() {
        eprintln!("  unlist is already running (PID {pid}).");
        eprintln!("  Use 'unlist stop' first.");
        std::process::exit(1);
    }

    let pid_path = pid_file_path();
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    init_tracing();
    info!("starting unlist v{}", env!("CARGO_PKG_VERSION"));

    std::fs::write(&pid_path, std::process::id().to_string())
        .context("failed to write PID file")?;

    if !output::is_quiet() {
        eprintln!(
            "  unlist v{} started (PID {})",
            env!("CARGO_PKG_VERSION"),
            std::process::id()
        );
    }

    let engine = build_engine(brokers_dir, db).await?;
    engine.bus.emit(EngineEvent::EngineStarted {
        version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);
    let cancel = Arc::clone(&engine.cancel);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("received shutdown signal");
        // Running jobs stop before their next action; tuples stay due.
        cancel.store(true, Ordering::Relaxed);
        shutdown_signal.notify_one();
    });

    engine.scheduler.run(shutdown).await;

    // Removed last: `unlist stop` polls this file to learn the drain is
    // complete.
    let _ = std::fs::remove_file(&pid_path);
    if !output::is_quiet() {
        eprintln!("  unlist stopped.");
    }
    Ok(())
}

/// Resolves on ctrl-c or, on unix, SIGTERM (what `unlist stop` sends).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
