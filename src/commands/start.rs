use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::resolve::{is_packaged, resolve_config};
use crate::error::StartupFailure;
use crate::logging;
use crate::orchestrator::health::HealthGate;
use crate::orchestrator::recovery::{ConsoleSurface, CrashRecoveryWatcher, UiMonitor, UiRelaunch};
use crate::orchestrator::run::InstanceLock;
use crate::orchestrator::state::InstanceState;
use crate::orchestrator::{await_existing_instance, run_deadline, Orchestrator, Workspace};
use crate::ui::logs::LogWriter;
use crate::ui::summary;

/// Exit code for failures an operator has to fix before relaunching.
pub const EXIT_NEEDS_OPERATOR: i32 = 2;
/// Exit code for failures a plain relaunch may clear.
pub const EXIT_RETRYABLE: i32 = 1;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub fn exit_code(failure: &StartupFailure) -> i32 {
    match failure.startup_error() {
        Some(e) if !e.is_retryable() => EXIT_NEEDS_OPERATOR,
        _ => EXIT_RETRYABLE,
    }
}

fn state_dir_of(config_path: &Path) -> Result<PathBuf> {
    let canonical = config_path
        .canonicalize()
        .with_context(|| format!("resolving {}", config_path.display()))?;
    let config_dir = canonical.parent().unwrap_or(Path::new("."));
    Ok(InstanceState::state_dir_for(config_dir))
}

pub async fn run(config_file: Option<&Path>, follow: bool) -> Result<i32> {
    let config_path = resolve_config(config_file)?;
    let state_dir = state_dir_of(&config_path)?;
    let _log_guard = logging::init(Some(&InstanceState::logs_dir_for(&state_dir)));
    info!(
        config = %config_path.display(),
        mode = if is_packaged() { "packaged" } else { "development" },
        "kioskboot starting"
    );

    let ws = Workspace::load(&config_path)?;
    let Some(_lock) = InstanceLock::try_acquire(&ws.identity.state_dir)? else {
        return attach(&ws).await;
    };
    // Replace whatever an earlier run left so late launchers never see it.
    InstanceState::new(&ws.identity.slug, &ws.identity.config_path)
        .save(&ws.identity.state_dir)
        .context("writing state.json")?;

    let orchestrator = Orchestrator::new(ws);
    if follow {
        let width = orchestrator
            .workspace()
            .config
            .services
            .iter()
            .map(|s| s.name.len())
            .max()
            .unwrap_or(8);
        let writer = LogWriter::new(orchestrator.supervisor().subscribe_logs(), width);
        tokio::spawn(writer.run());
    }

    let ready = match orchestrator.ensure_started().await {
        Ok(ready) => ready,
        Err(failure) => {
            summary::print_failure(&failure);
            orchestrator.supervisor().drain().await;
            return Ok(exit_code(&failure));
        }
    };
    summary::print_ready_summary(&orchestrator.workspace().identity, &ready);

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let config = &orchestrator.workspace().config;
    if config.recovery.enabled {
        let (tx, rx) = mpsc::channel(8);
        let monitor = UiMonitor::new(
            orchestrator.gate().clone(),
            ready.ui.service.clone(),
            ready.ui.rendered.health_url.clone(),
            config.recovery.monitor_interval,
            config.timeouts.reachable,
        );
        tracker.spawn(monitor.run(orchestrator.supervisor().subscribe_exits(), tx, cancel.clone()));

        let watcher = CrashRecoveryWatcher::new(
            ConsoleSurface,
            UiRelaunch::new(orchestrator.clone(), ready.clone()),
            config.recovery.delay,
        );
        tracker.spawn(watcher.run(rx, cancel.clone()));
    }
    tracker.close();

    wait_for_shutdown_signal().await;
    eprintln!("\nShutting down...");

    cancel.cancel();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, tracker.wait()).await.is_err() {
        warn!("recovery tasks did not stop in time");
    }
    orchestrator.shutdown().await;
    info!("all services stopped");
    Ok(0)
}

/// Another process owns this install: wait for its UI instead of starting a
/// second copy of everything.
async fn attach(ws: &Workspace) -> Result<i32> {
    info!("another instance is running, waiting for it to become ready");
    let gate = HealthGate::new(ws.config.timeouts.poll_interval);
    let url = await_existing_instance(&ws.identity.state_dir, &gate, run_deadline(&ws.config)).await?;
    println!("{url}");
    Ok(0)
}

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
            warn!(error = %e, "cannot listen for SIGTERM");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
