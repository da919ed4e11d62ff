use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use owo_colors::OwoColorize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StartupError;
use crate::orchestrator::health::HealthGate;
use crate::orchestrator::supervisor::ExitEvent;
use crate::orchestrator::{Orchestrator, ReadyState};

/// Something went wrong on the UI surface after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// The UI URL stopped answering.
    NavigationFailed { url: String, reason: String },
    /// The UI server process went away on its own.
    RendererCrashed { reason: String },
}

impl SurfaceEvent {
    pub fn describe(&self) -> String {
        match self {
            SurfaceEvent::NavigationFailed { url, reason } => {
                format!("could not load {url}: {reason}")
            }
            SurfaceEvent::RendererCrashed { reason } => format!("UI crashed: {reason}"),
        }
    }
}

/// Where the user sees the kiosk. Both calls must return quickly.
pub trait UiSurface: Send + Sync {
    fn show_error(&self, message: &str);
    fn reload(&self, url: &str);
}

/// Brings the UI server back and returns the URL to reload.
pub trait Relaunch: Send + Sync {
    fn relaunch(&self) -> BoxFuture<'_, Result<String, StartupError>>;
}

/// Relaunches the UI server of a ready run through its orchestrator.
pub struct UiRelaunch {
    orchestrator: Arc<Orchestrator>,
    ready: Arc<ReadyState>,
}

impl UiRelaunch {
    pub fn new(orchestrator: Arc<Orchestrator>, ready: Arc<ReadyState>) -> Self {
        Self {
            orchestrator,
            ready,
        }
    }
}

impl Relaunch for UiRelaunch {
    fn relaunch(&self) -> BoxFuture<'_, Result<String, StartupError>> {
        async move {
            let outcome = self.orchestrator.relaunch_ui(&self.ready).await?;
            info!(pid = ?outcome.pid(), "UI server relaunched");
            Ok(self.ready.ui_url())
        }
        .boxed()
    }
}

/// Terminal output stands in for a window when running headless.
pub struct ConsoleSurface;

impl UiSurface for ConsoleSurface {
    fn show_error(&self, message: &str) {
        eprintln!("  {} {}", "!".red().bold(), message);
    }

    fn reload(&self, url: &str) {
        eprintln!("  {} UI available again at {}", "✓".green(), url.cyan());
    }
}

// ---------------------------------------------------------------------------
// CrashRecoveryWatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered { url: String },
    Failed { error: String },
    Cancelled,
}

/// One relaunch attempt per event. Events that arrive while an attempt is
/// running are folded into it.
pub struct CrashRecoveryWatcher<S, R> {
    surface: S,
    relauncher: R,
    delay: Duration,
}

impl<S: UiSurface, R: Relaunch> CrashRecoveryWatcher<S, R> {
    pub fn new(surface: S, relauncher: R, delay: Duration) -> Self {
        Self {
            surface,
            relauncher,
            delay,
        }
    }

    /// Handle events until the channel closes or `cancel` fires.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<SurfaceEvent>,
        cancel: CancellationToken,
    ) -> Vec<RecoveryOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let outcome = self.recover(&event, &cancel).await;
            let stop = outcome == RecoveryOutcome::Cancelled;
            outcomes.push(outcome);
            if stop {
                break;
            }

            let mut folded = 0usize;
            while events.try_recv().is_ok() {
                folded += 1;
            }
            if folded > 0 {
                debug!(folded, "dropped events raised during recovery");
            }
        }
        outcomes
    }

    pub async fn recover(&self, event: &SurfaceEvent, cancel: &CancellationToken) -> RecoveryOutcome {
        let message = event.describe();
        warn!(event = %message, "UI failure, relaunching");
        self.surface
            .show_error(&format!("{message}. Restarting the UI server..."));

        tokio::select! {
            _ = cancel.cancelled() => return RecoveryOutcome::Cancelled,
            _ = tokio::time::sleep(self.delay) => {}
        }

        match self.relauncher.relaunch().await {
            Ok(url) => {
                self.surface.reload(&url);
                RecoveryOutcome::Recovered { url }
            }
            Err(e) => {
                warn!(error = %e, "UI relaunch failed");
                self.surface
                    .show_error(&format!("The UI server could not be restarted: {e}"));
                RecoveryOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// UiMonitor: turns health loss and unexpected exits into events
// ---------------------------------------------------------------------------

pub struct UiMonitor {
    gate: HealthGate,
    service: String,
    health_url: String,
    interval: Duration,
    probe_timeout: Duration,
}

impl UiMonitor {
    pub fn new(
        gate: HealthGate,
        service: impl Into<String>,
        health_url: impl Into<String>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            gate,
            service: service.into(),
            health_url: health_url.into(),
            interval,
            probe_timeout,
        }
    }

    /// Emit one event per transition from healthy to failing. Exits the
    /// supervisor asked for are not failures.
    pub async fn run(
        self,
        mut exits: broadcast::Receiver<ExitEvent>,
        events: mpsc::Sender<SurfaceEvent>,
        cancel: CancellationToken,
    ) {
        let mut healthy = true;
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                exit = exits.recv() => match exit {
                    Ok(exit) if exit.service == self.service && !exit.requested => {
                        healthy = false;
                        Some(SurfaceEvent::RendererCrashed {
                            reason: match exit.code {
                                Some(code) => format!("UI server exited with code {code}"),
                                None => "UI server was killed".to_string(),
                            },
                        })
                    }
                    Ok(_) => None,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "exit events lagged");
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tick.tick() => {
                    let now = self.gate.is_reachable(&self.health_url, self.probe_timeout).await;
                    let event = (healthy && !now).then(|| SurfaceEvent::NavigationFailed {
                        url: self.health_url.clone(),
                        reason: "health check failed".to_string(),
                    });
                    healthy = now;
                    event
                }
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
}
