use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::interpolate::{RenderedService, ServiceAddress};
use crate::error::StartupError;
use crate::orchestrator::health::{HealthCheckResult, HealthGate};
use crate::orchestrator::ports::is_port_occupied;
use crate::orchestrator::supervisor::{ExitEvent, SpawnRequest, Supervisor};
use crate::platform;

/// What `ensure_running` did to get the service up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Something already answered the health URL; nothing was spawned.
    Reused,
    Spawned { pid: u32 },
}

impl LaunchOutcome {
    pub fn pid(&self) -> Option<u32> {
        match self {
            LaunchOutcome::Reused => None,
            LaunchOutcome::Spawned { pid } => Some(*pid),
        }
    }
}

/// One service launch, fully resolved.
#[derive(Debug, Clone)]
pub struct LaunchTarget<'a> {
    pub service: &'a str,
    pub address: &'a ServiceAddress,
    pub rendered: &'a RenderedService,
    pub cwd: Option<PathBuf>,
    pub health_timeout: Duration,
}

/// Brings a single service up: reuse, refuse, or spawn and wait.
#[derive(Clone)]
pub struct Launcher {
    supervisor: Supervisor,
    gate: HealthGate,
    reachable_timeout: Duration,
    probe_timeout: Duration,
}

impl Launcher {
    pub fn new(
        supervisor: Supervisor,
        gate: HealthGate,
        reachable_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            supervisor,
            gate,
            reachable_timeout,
            probe_timeout,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn gate(&self) -> &HealthGate {
        &self.gate
    }

    pub async fn ensure_running(
        &self,
        target: LaunchTarget<'_>,
    ) -> Result<LaunchOutcome, StartupError> {
        let service = target.service;
        let url = &target.rendered.health_url;

        if self.gate.is_reachable(url, self.reachable_timeout).await {
            info!(service, url = %url, "already up");
            return Ok(LaunchOutcome::Reused);
        }

        let addr = target.address;
        if is_port_occupied(&addr.host, addr.port, self.probe_timeout).await {
            let owner = platform::identify_port_owner(addr.port);
            warn!(service, port = addr.port, owner = ?owner, "port taken by a process that is not healthy");
            return Err(StartupError::PortInUse {
                service: service.to_string(),
                port: addr.port,
                owner,
            });
        }

        // Subscribed before spawning so a crash on boot cannot be missed.
        let mut exits = self.supervisor.subscribe_exits();
        let handle = self
            .supervisor
            .spawn(SpawnRequest {
                service: service.to_string(),
                program: target.rendered.program.clone(),
                args: target.rendered.args.clone(),
                env: target.rendered.env.clone(),
                cwd: target.cwd,
            })
            .await?;

        info!(service, url = %url, timeout = ?target.health_timeout, "waiting for health");
        let ready = tokio::select! {
            result = self.gate.await_ready(url, target.health_timeout) => result,
            code = wait_for_exit(&mut exits, &self.supervisor, service, handle.pid) => {
                // A launcher that hands off to a detached server may exit
                // after the server is already up.
                if self.gate.is_reachable(url, self.reachable_timeout).await {
                    info!(service, pid = handle.pid, "launcher exited, service healthy");
                    return Ok(LaunchOutcome::Spawned { pid: handle.pid });
                }
                warn!(service, pid = handle.pid, ?code, "exited before becoming healthy");
                return Err(StartupError::ExitedEarly {
                    service: service.to_string(),
                    code,
                    log_path: handle.log_path,
                });
            }
        };
        match ready {
            HealthCheckResult::Ready { elapsed } => {
                info!(service, pid = handle.pid, ?elapsed, "healthy");
                Ok(LaunchOutcome::Spawned { pid: handle.pid })
            }
            HealthCheckResult::TimedOut { elapsed } => Err(StartupError::LaunchTimeout {
                service: service.to_string(),
                url: url.clone(),
                elapsed,
                log_path: handle.log_path,
            }),
        }
    }
}

/// Resolve with the exit code once `pid` of `service` has exited.
async fn wait_for_exit(
    exits: &mut broadcast::Receiver<ExitEvent>,
    supervisor: &Supervisor,
    service: &str,
    pid: u32,
) -> Option<i32> {
    loop {
        match exits.recv().await {
            Ok(ev) if ev.service == service && ev.pid == pid => return ev.code,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {
                if let Some(exit) = supervisor.last_exit(service).filter(|h| h.pid == pid) {
                    return exit.exit_code;
                }
            }
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
