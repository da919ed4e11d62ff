pub mod graph;
pub mod health;
pub mod launcher;
pub mod ports;
pub mod preconditions;
pub mod recovery;
pub mod run;
pub mod state;
pub mod supervisor;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config;
use crate::config::env::{EnvPool, ENV_FILE_VAR};
use crate::config::interpolate::{
    build_template_vars, format_template_errors, render_service, RenderedService, ServiceAddress,
};
use crate::config::model::{KioskConfig, ServiceConfig};
use crate::config::overrides::Overrides;
use crate::diagnostics::{DiagnosticsReporter, StaticChecks};
use crate::error::{StartupError, StartupFailure};
use crate::identity::InstanceIdentity;

use graph::DependencyResolver;
use health::HealthGate;
use launcher::{LaunchOutcome, LaunchTarget, Launcher};
use ports::{PortClaim, PortPlan, PortResolver, UiPortChoice};
use preconditions::PreconditionReport;
use run::{Flight, InstanceLock, SingleFlight};
use state::{InstanceState, ServiceState};
use supervisor::Supervisor;

/// Variable handed to the UI server telling it whether to apply its CORS
/// workaround.
pub const CORS_WORKAROUND_ENV: &str = "KIOSK_CORS_WORKAROUND";

// ---------------------------------------------------------------------------
// Workspace: config plus everything resolved from the environment
// ---------------------------------------------------------------------------

/// A loaded, validated kiosk install.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub config: KioskConfig,
    pub identity: InstanceIdentity,
    pub pool: EnvPool,
    pub overrides: Overrides,
}

impl Workspace {
    /// Load and validate the config, then resolve the env file and the
    /// override variables.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config = config::load_validated(config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?;
        let identity = InstanceIdentity::from_config(&config, config_path)
            .context("computing instance identity")?;
        let explicit = std::env::var_os(ENV_FILE_VAR).map(PathBuf::from);
        let pool = EnvPool::load(
            explicit.as_deref(),
            config.project.env_file.as_deref(),
            &identity.config_dir,
        )?;
        Self::with_env(config, identity, pool)
    }

    pub fn with_env(config: KioskConfig, identity: InstanceIdentity, pool: EnvPool) -> Result<Self> {
        let overrides = Overrides::from_env(&config, &pool)?;
        Ok(Self {
            config,
            identity,
            pool,
            overrides,
        })
    }

    pub fn host_for(&self, service: &str) -> &str {
        self.overrides.host_for(service, &self.config.ports.host)
    }

    pub fn preferred_port(&self, svc: &ServiceConfig) -> Result<u16, StartupError> {
        self.overrides
            .port_for(&svc.name, svc.port)
            .ok_or_else(|| StartupError::Config(format!("service '{}' has no port", svc.name)))
    }

    pub fn fallback_base(&self) -> Option<u16> {
        self.overrides.fallback_base(self.config.ports.fallback_base)
    }

    /// Services in launch order: dependencies first, UI server last.
    pub fn launch_order(&self) -> Result<Vec<String>, StartupError> {
        DependencyResolver::from_config(&self.config)
            .and_then(|r| r.start_order())
            .map_err(StartupError::Config)
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartupPhase {
    Idle,
    PreconditionsChecked,
    PortsPlanned,
    /// Launching the backend at this index of the launch order.
    BackendsStarting(usize),
    BackendsUp,
    UiStarting,
    Ready,
    Failed,
}

impl std::fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupPhase::Idle => f.write_str("idle"),
            StartupPhase::PreconditionsChecked => f.write_str("preconditions-checked"),
            StartupPhase::PortsPlanned => f.write_str("ports-planned"),
            StartupPhase::BackendsStarting(i) => write!(f, "backends-starting({i})"),
            StartupPhase::BackendsUp => f.write_str("backends-up"),
            StartupPhase::UiStarting => f.write_str("ui-starting"),
            StartupPhase::Ready => f.write_str("ready"),
            StartupPhase::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceStatus {
    NotStarted,
    Started,
    Healthy,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::NotStarted => "not-started",
            ServiceStatus::Started => "started",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Failed => "failed",
        }
    }
}

/// Per-service progress within one run.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceProgress {
    pub name: String,
    pub ui: bool,
    pub status: ServiceStatus,
    pub address: Option<ServiceAddress>,
    pub pid: Option<u32>,
    pub reused: bool,
    /// Left to an external manager; never launched.
    pub external: bool,
}

/// Everything one orchestrator run has learned, threaded through every
/// stage instead of living in globals.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorRun {
    pub phase: StartupPhase,
    /// Last phase reached before failing.
    pub failed_in: Option<StartupPhase>,
    pub services: Vec<ServiceProgress>,
    pub plan: Option<PortPlan>,
    /// Addresses of services that are up, available to later templates.
    pub addresses: BTreeMap<String, ServiceAddress>,
    pub preconditions: Option<PreconditionReport>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl OrchestratorRun {
    pub fn new(config: &KioskConfig, order: &[String]) -> Self {
        let services = order
            .iter()
            .filter_map(|name| config.service(name))
            .map(|svc| ServiceProgress {
                name: svc.name.clone(),
                ui: svc.is_ui(),
                status: ServiceStatus::NotStarted,
                address: None,
                pid: None,
                reused: false,
                external: false,
            })
            .collect();
        Self {
            phase: StartupPhase::Idle,
            failed_in: None,
            services,
            plan: None,
            addresses: BTreeMap::new(),
            preconditions: None,
            started: Some(Instant::now()),
        }
    }

    pub fn advance(&mut self, phase: StartupPhase) {
        info!(from = %self.phase, to = %phase, "startup phase");
        self.phase = phase;
    }

    pub fn fail(&mut self) {
        if self.phase != StartupPhase::Failed {
            self.failed_in = Some(self.phase);
            self.phase = StartupPhase::Failed;
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    pub fn progress(&self, name: &str) -> Option<&ServiceProgress> {
        self.services.iter().find(|s| s.name == name)
    }

    fn progress_mut(&mut self, name: &str) -> Option<&mut ServiceProgress> {
        self.services.iter_mut().find(|s| s.name == name)
    }

    fn update(&mut self, name: &str, f: impl FnOnce(&mut ServiceProgress)) {
        if let Some(progress) = self.progress_mut(name) {
            f(progress);
        }
    }
}

/// A launched service with everything needed to launch it again.
#[derive(Debug, Clone)]
pub struct PreparedLaunch {
    pub service: String,
    pub address: ServiceAddress,
    pub rendered: RenderedService,
    pub cwd: PathBuf,
    pub health_timeout: Duration,
}

impl PreparedLaunch {
    pub fn target(&self) -> LaunchTarget<'_> {
        LaunchTarget {
            service: &self.service,
            address: &self.address,
            rendered: &self.rendered,
            cwd: Some(self.cwd.clone()),
            health_timeout: self.health_timeout,
        }
    }
}

/// Successful run: every backend healthy, UI server serving.
#[derive(Debug, Clone)]
pub struct ReadyState {
    pub run: OrchestratorRun,
    pub ui: PreparedLaunch,
}

impl ReadyState {
    pub fn ui_url(&self) -> String {
        self.ui.address.url()
    }
}

pub type RunOutcome = Result<Arc<ReadyState>, Arc<StartupFailure>>;

/// Lifecycle of the one run a process may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

/// Dry-run result for `plan`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    pub order: Vec<String>,
    pub plan: PortPlan,
    pub ui_service: String,
    pub ui_port: u16,
    pub ui_already_serving: bool,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives one startup run per process and owns the processes it starts.
pub struct Orchestrator {
    ws: Workspace,
    launcher: Launcher,
    resolver: PortResolver,
    reporter: DiagnosticsReporter,
    flight: SingleFlight<RunOutcome>,
}

impl Orchestrator {
    pub fn new(ws: Workspace) -> Arc<Self> {
        let timeouts = &ws.config.timeouts;
        let supervisor = Supervisor::new(ws.identity.logs_dir.clone(), timeouts.kill_grace);
        let gate = HealthGate::new(timeouts.poll_interval);
        let launcher = Launcher::new(supervisor, gate.clone(), timeouts.reachable, timeouts.tcp_probe);
        let resolver = PortResolver::new(timeouts.tcp_probe, gate, timeouts.reachable);
        let reporter = DiagnosticsReporter::new(ws.identity.logs_dir.clone(), &ws.config.diagnostics);
        Arc::new(Self {
            ws,
            launcher,
            resolver,
            reporter,
            flight: SingleFlight::new(),
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.ws
    }

    pub fn supervisor(&self) -> &Supervisor {
        self.launcher.supervisor()
    }

    pub fn gate(&self) -> &HealthGate {
        self.launcher.gate()
    }

    pub fn state(&self) -> RunState {
        match self.flight.status() {
            Flight::Empty => RunState::NotStarted,
            Flight::InFlight => RunState::Running,
            Flight::Done(Ok(_)) => RunState::Succeeded,
            Flight::Done(Err(_)) => RunState::Failed,
        }
    }

    /// Start the run, or attach to the one already started. Every caller
    /// observes the same outcome.
    pub async fn ensure_started(self: &Arc<Self>) -> RunOutcome {
        let this = Arc::clone(self);
        let (flight, started) = self.flight.join_or_start(move || async move { this.run().await });
        if !started {
            info!("startup already requested, attaching to the current run");
        }
        flight.await
    }

    async fn run(&self) -> RunOutcome {
        let order = self.ws.launch_order();
        let names: Vec<String> = match &order {
            Ok(order) => order.clone(),
            Err(_) => self.ws.config.services.iter().map(|s| s.name.clone()).collect(),
        };
        let mut run = OrchestratorRun::new(&self.ws.config, &names);

        let result = match order {
            Ok(order) => self.drive(&mut run, &order).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(ready) => {
                info!(url = %ready.ui_url(), elapsed = ?ready.run.elapsed(), "kiosk ready");
                Ok(Arc::new(ready))
            }
            Err(error) => Err(Arc::new(self.unwind(&mut run, error).await)),
        }
    }

    /// Rollback, report, and hand back the original cause.
    async fn unwind(&self, run: &mut OrchestratorRun, error: anyhow::Error) -> StartupFailure {
        run.fail();
        error!(phase = ?run.failed_in, "startup failed: {:#}", error);

        self.supervisor().kill_all().await;

        let checks = StaticChecks::gather(&self.ws);
        let report_path = match self.reporter.write_report(
            &self.ws.config.project.name,
            &error,
            run,
            &checks,
            self.ws.pool.vars(),
        ) {
            Ok(path) => {
                info!(path = %path.display(), "diagnostic report written");
                Some(path)
            }
            Err(e) => {
                warn!(error = %e, "could not write diagnostic report");
                None
            }
        };

        let report = report_path.as_ref().map(|p| p.display().to_string());
        InstanceState::update(&self.ws.identity.state_dir, |s| {
            s.phase = StartupPhase::Failed.to_string();
            s.report_path = report;
            s.services.clear();
        });

        StartupFailure { error, report_path }
    }

    async fn drive(&self, run: &mut OrchestratorRun, order: &[String]) -> Result<ReadyState> {
        let ws = &self.ws;
        let config = &ws.config;
        let timeouts = &config.timeouts;
        let state_dir = &ws.identity.state_dir;

        if let Err(e) = InstanceState::new(&ws.identity.slug, &ws.identity.config_path).save(state_dir)
        {
            warn!(error = %e, "could not write state.json");
        }

        // Idle -> PreconditionsChecked
        let pre = preconditions::check_all(config, &ws.identity.config_dir, &ws.pool, &ws.overrides)
            .await?;
        let runtime = pre.runtime.as_ref().map(|r| r.path.clone());
        run.preconditions = Some(pre);
        run.advance(StartupPhase::PreconditionsChecked);

        // PreconditionsChecked -> PortsPlanned
        let backends: Vec<&ServiceConfig> = order
            .iter()
            .filter_map(|name| config.service(name))
            .filter(|svc| !svc.is_ui())
            .collect();
        let plan = self.plan_ports(&backends, runtime.as_deref(), run).await?;
        run.plan = Some(plan.clone());
        InstanceState::update(state_dir, |s| {
            s.phase = StartupPhase::PortsPlanned.to_string();
            s.plan = Some(plan.clone());
        });
        run.advance(StartupPhase::PortsPlanned);

        // PortsPlanned -> BackendsStarting(i) -> BackendsUp
        for (i, svc) in backends.iter().enumerate() {
            run.advance(StartupPhase::BackendsStarting(i));
            let port = plan
                .resolved_for(&svc.name)
                .ok_or_else(|| StartupError::Config(format!("no planned port for '{}'", svc.name)))?;
            let address = ServiceAddress::new(ws.host_for(&svc.name), port);

            if ws.overrides.external_backends {
                info!(service = %svc.name, url = %address.url(), "externally managed, not launching");
                run.update(&svc.name, |p| {
                    p.external = true;
                    p.address = Some(address.clone());
                });
                run.addresses.insert(svc.name.clone(), address);
                continue;
            }

            self.launch_service(run, svc, address, runtime.as_deref(), timeouts.health)
                .await?;
        }
        run.advance(StartupPhase::BackendsUp);

        // BackendsUp -> UiStarting
        run.advance(StartupPhase::UiStarting);
        let ui = config
            .ui_service()
            .ok_or_else(|| StartupError::Config("no service has kind = \"ui\"".to_string()))?;
        let choice = self.choose_ui_port(ui, runtime.as_deref(), run, &plan.resolved).await?;
        let address = ServiceAddress::new(ws.host_for(&ui.name), choice.port);
        let ui_launch = self
            .launch_service(run, ui, address, runtime.as_deref(), timeouts.ui_health)
            .await?;

        // UiStarting -> Ready
        run.advance(StartupPhase::Ready);
        let ui_url = ui_launch.address.url();
        InstanceState::update(state_dir, |s| {
            s.phase = StartupPhase::Ready.to_string();
            s.ui_url = Some(ui_url);
        });

        Ok(ReadyState {
            run: run.clone(),
            ui: ui_launch,
        })
    }

    async fn plan_ports(
        &self,
        backends: &[&ServiceConfig],
        runtime: Option<&str>,
        run: &OrchestratorRun,
    ) -> Result<PortPlan, StartupError> {
        let claims = backends
            .iter()
            .map(|svc| {
                Ok(PortClaim {
                    service: svc.name.clone(),
                    host: self.ws.host_for(&svc.name).to_string(),
                    preferred: self.ws.preferred_port(svc)?,
                })
            })
            .collect::<Result<Vec<_>, StartupError>>()?;

        if self.ws.overrides.external_backends {
            return Ok(PortPlan::preferred_only(
                claims.iter().map(|c| c.service.clone()).collect(),
                claims.iter().map(|c| c.preferred).collect(),
            ));
        }
        let health_url = |service: &str, port: u16| {
            self.ws
                .config
                .service(service)
                .and_then(|svc| {
                    let address = ServiceAddress::new(self.ws.host_for(service), port);
                    self.render(svc, &address, runtime, run).ok()
                })
                .map(|r| r.health_url)
                .unwrap_or_default()
        };
        self.resolver
            .plan(&claims, health_url, self.ws.fallback_base())
            .await
    }

    async fn choose_ui_port(
        &self,
        ui: &ServiceConfig,
        runtime: Option<&str>,
        run: &OrchestratorRun,
        reserved: &[u16],
    ) -> Result<UiPortChoice, StartupError> {
        let preferred = self.ws.preferred_port(ui)?;
        let host = self.ws.host_for(&ui.name).to_string();
        let health_url = |port: u16| {
            self.render(ui, &ServiceAddress::new(host.clone(), port), runtime, run)
                .map(|r| r.health_url)
                .unwrap_or_default()
        };
        Ok(self
            .resolver
            .resolve_ui_port(
                &host,
                preferred,
                health_url,
                self.ws.config.ports.ui_scan_window,
                reserved,
            )
            .await)
    }

    /// Expand a service's templates against the addresses known so far and
    /// layer its env over the env pool.
    fn render(
        &self,
        svc: &ServiceConfig,
        address: &ServiceAddress,
        runtime: Option<&str>,
        run: &OrchestratorRun,
    ) -> Result<RenderedService, StartupError> {
        let vars = build_template_vars(&self.ws.config.project.name, runtime, address, &run.addresses);
        let mut rendered = render_service(svc, &self.ws.config.env, &vars)
            .map_err(|errs| StartupError::Config(format_template_errors(&errs)))?;

        let mut env = self.ws.pool.vars().clone();
        env.append(&mut rendered.env);
        if svc.is_ui() {
            let flag = if self.ws.overrides.cors_workaround { "1" } else { "0" };
            env.insert(CORS_WORKAROUND_ENV.to_string(), flag.to_string());
        }
        rendered.env = env;
        Ok(rendered)
    }

    async fn launch_service(
        &self,
        run: &mut OrchestratorRun,
        svc: &ServiceConfig,
        address: ServiceAddress,
        runtime: Option<&str>,
        health_timeout: Duration,
    ) -> Result<PreparedLaunch, StartupError> {
        let rendered = self.render(svc, &address, runtime, run)?;
        let prepared = PreparedLaunch {
            service: svc.name.clone(),
            address: address.clone(),
            rendered,
            cwd: preconditions::service_cwd(&self.ws.identity.config_dir, svc.cwd.as_deref()),
            health_timeout,
        };

        run.update(&svc.name, |p| {
            p.status = ServiceStatus::Started;
            p.address = Some(address.clone());
        });

        match self.launcher.ensure_running(prepared.target()).await {
            Ok(outcome) => {
                let pid = outcome.pid();
                run.update(&svc.name, |p| {
                    p.status = ServiceStatus::Healthy;
                    p.pid = pid;
                    p.reused = outcome == LaunchOutcome::Reused;
                });
                run.addresses.insert(svc.name.clone(), address.clone());
                let ui = svc.is_ui();
                InstanceState::update(&self.ws.identity.state_dir, |s| {
                    s.services.insert(
                        svc.name.clone(),
                        ServiceState {
                            pid,
                            host: address.host.clone(),
                            port: address.port,
                            reused: pid.is_none(),
                            ui,
                        },
                    );
                });
                Ok(prepared)
            }
            Err(e) => {
                let pid = self.supervisor().handle(&svc.name).map(|h| h.pid);
                run.update(&svc.name, |p| {
                    p.status = ServiceStatus::Failed;
                    p.pid = pid;
                });
                Err(e)
            }
        }
    }

    /// Kill the UI server (if it is still around) and bring it back on the
    /// same address. Backends are left alone.
    pub async fn relaunch_ui(&self, ready: &ReadyState) -> Result<LaunchOutcome, StartupError> {
        let ui = &ready.ui;
        if let Err(e) = self.supervisor().kill_tree(&ui.service).await {
            warn!(service = %ui.service, error = %e, "could not stop UI server before relaunch");
        }
        let outcome = self.launcher.ensure_running(ui.target()).await?;
        InstanceState::update_service_pid(&self.ws.identity.state_dir, &ui.service, outcome.pid());
        Ok(outcome)
    }

    /// Port plan and UI port choice without launching anything.
    pub async fn preview(&self) -> Result<PlanPreview> {
        let order = self.ws.launch_order()?;
        let backends: Vec<&ServiceConfig> = order
            .iter()
            .filter_map(|name| self.ws.config.service(name))
            .filter(|svc| !svc.is_ui())
            .collect();
        let scratch = OrchestratorRun::new(&self.ws.config, &order);
        let plan = self.plan_ports(&backends, None, &scratch).await?;

        let ui = self
            .ws
            .config
            .ui_service()
            .ok_or_else(|| StartupError::Config("no service has kind = \"ui\"".to_string()))?;
        let mut scratch = scratch;
        for svc in &backends {
            if let Some(port) = plan.resolved_for(&svc.name) {
                scratch
                    .addresses
                    .insert(svc.name.clone(), ServiceAddress::new(self.ws.host_for(&svc.name), port));
            }
        }
        let choice = self.choose_ui_port(ui, None, &scratch, &plan.resolved).await?;

        Ok(PlanPreview {
            order,
            plan,
            ui_service: ui.name.clone(),
            ui_port: choice.port,
            ui_already_serving: choice.already_serving,
        })
    }

    /// Stop everything this process started and forget the published state.
    pub async fn shutdown(&self) {
        self.supervisor().kill_all().await;
        self.supervisor().drain().await;
        if let Err(e) = InstanceState::remove(&self.ws.identity.state_dir) {
            warn!(error = %e, "could not remove state.json");
        }
    }
}

// ---------------------------------------------------------------------------
// Second instance
// ---------------------------------------------------------------------------

/// For a process that lost the instance lock: wait for the owning process to
/// publish its UI URL, then for that URL to be healthy. State left behind by
/// anyone but the live lock holder is ignored.
pub async fn await_existing_instance(
    state_dir: &Path,
    gate: &HealthGate,
    deadline: Duration,
) -> Result<String> {
    let start = Instant::now();
    loop {
        if let Some(state) = current_state(state_dir) {
            if state.phase == StartupPhase::Failed.to_string() {
                match state.report_path {
                    Some(report) => bail!(
                        "the running instance failed to start\n\nDiagnostic report: {report}"
                    ),
                    None => bail!("the running instance failed to start"),
                }
            }
            if let Some(url) = state.ui_url.clone() {
                let remaining = deadline.saturating_sub(start.elapsed());
                let service = state
                    .ui_service()
                    .map(|(name, _)| name.clone())
                    .unwrap_or_default();
                info!(url = %url, service = %service, "attaching to running instance");
                return match gate.await_ready(&url, remaining).await {
                    r if r.is_ready() => Ok(url),
                    r => bail!("UI server at {} not healthy after {:?}", url, r.elapsed()),
                };
            }
        }
        if start.elapsed() >= deadline {
            bail!(
                "timed out after {:?} waiting for the running instance to become ready",
                deadline
            );
        }
        tokio::time::sleep(gate.interval()).await;
    }
}

/// `state.json`, if it was written by the process holding the instance lock.
fn current_state(state_dir: &Path) -> Option<InstanceState> {
    let state = InstanceState::load(state_dir)?;
    let holder = InstanceLock::holder(state_dir)?;
    if state.pid != holder {
        debug!(state_pid = state.pid, holder, "ignoring state from an earlier run");
        return None;
    }
    crate::platform::is_process_alive(holder).then_some(state)
}

/// Upper bound for a whole run: every backend health wait plus the UI's.
pub fn run_deadline(config: &KioskConfig) -> Duration {
    let backends = config.backends().count() as u32;
    config.timeouts.health * backends + config.timeouts.ui_health
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::health::tests::serve_status;
    use axum::http::StatusCode;
    use std::net::TcpListener;

    fn workspace_with(dir: &Path, toml: &str, vars: &[(&str, &str)]) -> Workspace {
        let path = dir.join("kiosk.toml");
        std::fs::write(&path, toml).unwrap();
        let config = config::load_validated(&path).unwrap();
        let identity = InstanceIdentity::from_config(&config, &path).unwrap();
        let pool = EnvPool::from_layers(
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            BTreeMap::new(),
        );
        Workspace::with_env(config, identity, pool).unwrap()
    }

    fn workspace(dir: &Path, toml: &str) -> Workspace {
        workspace_with(dir, toml, &[])
    }

    /// Backend `core` and UI server `ui`, both already served by fixtures.
    fn reuse_config(core: u16, ui: u16) -> String {
        format!(
            r#"
            [project]
            name = "clinic"
            [timeouts]
            health = "2s"
            ui_health = "2s"
            [[services]]
            name = "core"
            command = "definitely-not-installed"
            port = {core}
            health = "/health"
            [[services]]
            name = "ui"
            kind = "ui"
            command = "definitely-not-installed"
            port = {ui}
            health = "/health"
            [services.env]
            CORE_URL = "{{{{ services.core.url }}}}"
            "#
        )
    }

    #[tokio::test]
    async fn running_services_are_reused_with_zero_spawns() {
        let core = serve_status(StatusCode::OK).await;
        let ui = serve_status(StatusCode::OK).await;
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(workspace(tmp.path(), &reuse_config(core, ui)));
        assert_eq!(orchestrator.state(), RunState::NotStarted);

        let ready = orchestrator.ensure_started().await.unwrap();
        assert_eq!(orchestrator.supervisor().spawn_count(), 0);
        assert_eq!(orchestrator.state(), RunState::Succeeded);
        assert_eq!(ready.run.phase, StartupPhase::Ready);
        assert_eq!(ready.ui_url(), format!("http://127.0.0.1:{ui}"));
        assert!(ready.run.services.iter().all(|s| s.reused && s.status == ServiceStatus::Healthy));

        let env = &ready.ui.rendered.env;
        assert_eq!(env["CORE_URL"], format!("http://127.0.0.1:{core}"));
        assert_eq!(env[CORS_WORKAROUND_ENV], "1");

        let state = InstanceState::load(&orchestrator.workspace().identity.state_dir).unwrap();
        assert_eq!(state.phase, "ready");
        assert_eq!(state.ui_url, Some(ready.ui_url()));
        assert!(state.services["core"].reused);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let core = serve_status(StatusCode::OK).await;
        let ui = serve_status(StatusCode::OK).await;
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(workspace(tmp.path(), &reuse_config(core, ui)));

        let (a, b) = tokio::join!(orchestrator.ensure_started(), orchestrator.ensure_started());
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        let late = orchestrator.ensure_started().await.unwrap();
        assert_eq!(late.ui_url(), format!("http://127.0.0.1:{ui}"));
    }

    #[tokio::test]
    async fn external_backends_are_not_launched() {
        let core = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let ui = serve_status(StatusCode::OK).await;
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace_with(
            tmp.path(),
            &reuse_config(core, ui),
            &[("KIOSK_EXTERNAL_BACKENDS", "1"), ("KIOSK_DISABLE_CORS_WORKAROUND", "1")],
        );
        let orchestrator = Orchestrator::new(ws);

        let ready = orchestrator.ensure_started().await.unwrap();
        let core_progress = ready.run.progress("core").unwrap();
        assert!(core_progress.external);
        assert_eq!(core_progress.status, ServiceStatus::NotStarted);
        assert_eq!(ready.ui.rendered.env[CORS_WORKAROUND_ENV], "0");
        assert_eq!(orchestrator.supervisor().spawn_count(), 0);
    }

    #[tokio::test]
    async fn exhausted_ports_spawn_nothing_and_write_report() {
        let busy = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_fallback = TcpListener::bind("127.0.0.1:0").unwrap();
        let core = busy.local_addr().unwrap().port();
        let base = busy_fallback.local_addr().unwrap().port();
        let ui = serve_status(StatusCode::OK).await;
        let tmp = tempfile::tempdir().unwrap();
        let toml = reuse_config(core, ui).replace(
            "[timeouts]",
            &format!("[ports]\n            fallback_base = {base}\n            [timeouts]"),
        );
        let orchestrator = Orchestrator::new(workspace(tmp.path(), &toml));

        let failure = orchestrator.ensure_started().await.unwrap_err();
        assert!(matches!(
            failure.startup_error(),
            Some(StartupError::PortsExhausted { preferred, fallback })
                if preferred == &vec![core] && fallback == &vec![base]
        ));
        assert_eq!(orchestrator.supervisor().spawn_count(), 0);
        assert_eq!(orchestrator.state(), RunState::Failed);

        let report = failure.report_path.as_ref().unwrap();
        let md = std::fs::read_to_string(report).unwrap();
        assert!(md.contains("- Phase: preconditions-checked"));
        assert!(md.contains("port-conflict (retryable: no)"));

        let state = InstanceState::load(&orchestrator.workspace().identity.state_dir).unwrap();
        assert_eq!(state.phase, "failed");
        assert_eq!(state.report_path, Some(report.display().to_string()));
        drop((busy, busy_fallback));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_timeout_rolls_back_every_spawned_process() {
        // Unhealthy for the reuse probe, healthy once the process is spawned.
        let (fixture, _hits) = crate::orchestrator::health::tests::serve_after(1).await;

        let ports = crate::orchestrator::ports::tests::free_block(3, &[fixture]);
        let (a, b, ui) = (ports, ports + 1, ports + 2);
        let tmp = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
            [project]
            name = "clinic"
            [timeouts]
            health = "1s"
            poll_interval = "50ms"
            kill_grace = "1s"
            [[services]]
            name = "a"
            command = "sh"
            args = ["-c", "echo a up; exec sleep 60"]
            port = {a}
            health = "http://127.0.0.1:{fixture}/health"
            [[services]]
            name = "b"
            command = "sh"
            args = ["-c", "echo b stuck at {{{{ services.a.url }}}}; exec sleep 60"]
            port = {b}
            [[services]]
            name = "ui"
            kind = "ui"
            command = "sh"
            args = ["-c", "exit 1"]
            port = {ui}
            "#
        );
        let orchestrator = Orchestrator::new(workspace(tmp.path(), &toml));

        let failure = orchestrator.ensure_started().await.unwrap_err();
        match failure.startup_error() {
            Some(StartupError::LaunchTimeout { service, .. }) => assert_eq!(service, "b"),
            other => panic!("expected launch timeout, got {other:?}"),
        }
        assert_eq!(orchestrator.supervisor().spawn_count(), 2);
        assert!(orchestrator.supervisor().is_empty(), "registry not empty after rollback");
        let a_exit = orchestrator.supervisor().last_exit("a").unwrap();
        assert!(!crate::platform::is_process_alive(a_exit.pid));

        let md = std::fs::read_to_string(failure.report_path.as_ref().unwrap()).unwrap();
        assert!(md.contains("| a | healthy |"));
        assert!(md.contains("| b | failed |"));
        assert!(md.contains("| ui | not-started |"));
        assert!(md.contains(&format!("b stuck at http://127.0.0.1:{a}")));
        orchestrator.supervisor().drain().await;
    }

    #[tokio::test]
    async fn healthy_backend_keeps_preferred_tier_with_fallback_configured() {
        let core = serve_status(StatusCode::OK).await;
        let ui = serve_status(StatusCode::OK).await;
        let base = crate::orchestrator::ports::tests::free_block(1, &[core, ui]);
        let tmp = tempfile::tempdir().unwrap();
        let toml = reuse_config(core, ui).replace(
            "[timeouts]",
            &format!("[ports]\n            fallback_base = {base}\n            [timeouts]"),
        );
        let orchestrator = Orchestrator::new(workspace(tmp.path(), &toml));

        let ready = orchestrator.ensure_started().await.unwrap();
        let plan = ready.run.plan.as_ref().unwrap();
        assert!(!plan.used_fallback);
        assert_eq!(plan.resolved, vec![core]);
        assert_eq!(plan.serving, vec![core]);
        assert!(ready.run.progress("core").unwrap().reused);
        assert_eq!(orchestrator.supervisor().spawn_count(), 0);
    }

    #[tokio::test]
    async fn late_launcher_ignores_state_of_a_previous_run() {
        let tmp = tempfile::tempdir().unwrap();
        let state_dir = tmp.path().join(".kiosk");
        let _lock = InstanceLock::try_acquire(&state_dir).unwrap().unwrap();

        let mut stale = InstanceState::new("clinic", &tmp.path().join("kiosk.toml"));
        stale.pid = std::process::id() + 1;
        stale.phase = StartupPhase::Failed.to_string();
        stale.report_path = Some("/old/startup-failure-OLD.md".to_string());
        stale.save(&state_dir).unwrap();

        let gate = HealthGate::new(Duration::from_millis(20));
        let err = await_existing_instance(&state_dir, &gate, Duration::from_millis(300))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("timed out"), "{err}");
        assert!(!err.contains("OLD"), "{err}");
    }

    #[tokio::test]
    async fn late_launcher_reports_failure_of_the_lock_holder() {
        let tmp = tempfile::tempdir().unwrap();
        let state_dir = tmp.path().join(".kiosk");
        let _lock = InstanceLock::try_acquire(&state_dir).unwrap().unwrap();

        let mut failed = InstanceState::new("clinic", &tmp.path().join("kiosk.toml"));
        failed.phase = StartupPhase::Failed.to_string();
        failed.report_path = Some("/logs/startup-failure-NEW.md".to_string());
        failed.save(&state_dir).unwrap();

        let gate = HealthGate::new(Duration::from_millis(20));
        let err = await_existing_instance(&state_dir, &gate, Duration::from_secs(5))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("startup-failure-NEW.md"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn relaunch_ui_respawns_only_the_ui_on_the_same_address() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let core = serve_status(StatusCode::OK).await;
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = healthy.clone();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ui_health = listener.local_addr().unwrap().port();
        let app = axum::Router::new().route(
            "/health",
            axum::routing::get(move || {
                let flag = flag.clone();
                async move {
                    if flag.load(Ordering::SeqCst) {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }
            }),
        );
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let ui = crate::orchestrator::ports::tests::free_block(1, &[core, ui_health]);
        let tmp = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
            [project]
            name = "clinic"
            [timeouts]
            health = "2s"
            ui_health = "5s"
            poll_interval = "50ms"
            kill_grace = "1s"
            [[services]]
            name = "core"
            command = "definitely-not-installed"
            port = {core}
            health = "/health"
            [[services]]
            name = "ui"
            kind = "ui"
            command = "sh"
            args = ["-c", "exec sleep 60"]
            port = {ui}
            health = "http://127.0.0.1:{ui_health}/health"
            "#
        );
        let orchestrator = Orchestrator::new(workspace(tmp.path(), &toml));

        // The UI turns healthy once the supervisor has spawned `count` processes.
        let healthy_after = |count: usize| {
            let orchestrator = orchestrator.clone();
            let healthy = healthy.clone();
            tokio::spawn(async move {
                while orchestrator.supervisor().spawn_count() < count {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                healthy.store(true, Ordering::SeqCst);
            })
        };

        healthy_after(1);
        let ready = orchestrator.ensure_started().await.unwrap();
        assert_eq!(orchestrator.supervisor().spawn_count(), 1);
        let first = orchestrator.supervisor().handle("ui").unwrap().pid;

        // Crash the UI server.
        healthy.store(false, Ordering::SeqCst);
        crate::platform::kill_tree(first, crate::platform::KillMode::Force)
            .await
            .unwrap();
        for _ in 0..100 {
            if orchestrator.supervisor().handle("ui").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(orchestrator.supervisor().handle("ui").is_none());

        healthy_after(2);
        let outcome = orchestrator.relaunch_ui(&ready).await.unwrap();
        let second = outcome.pid().unwrap();
        assert_ne!(second, first);
        assert_eq!(orchestrator.supervisor().spawn_count(), 2);
        assert!(orchestrator.supervisor().handle("core").is_none());
        assert_eq!(orchestrator.supervisor().handle("ui").unwrap().pid, second);

        let state = InstanceState::load(&orchestrator.workspace().identity.state_dir).unwrap();
        assert_eq!(state.services["ui"].pid, Some(second));
        assert_eq!(state.services["ui"].port, ready.ui.address.port);
        assert_eq!(ready.ui.address.port, ui);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn preview_plans_without_spawning() {
        let ports = crate::orchestrator::ports::tests::free_block(2, &[]);
        let tmp = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(workspace(tmp.path(), &reuse_config(ports, ports + 1)));

        let preview = orchestrator.preview().await.unwrap();
        assert_eq!(preview.order, vec!["core", "ui"]);
        assert_eq!(preview.plan.resolved, vec![ports]);
        assert_eq!(preview.ui_port, ports + 1);
        assert!(!preview.ui_already_serving);
        assert_eq!(orchestrator.state(), RunState::NotStarted);
        assert!(InstanceState::load(&orchestrator.workspace().identity.state_dir).is_none());
    }

    #[test]
    fn deadline_covers_every_health_wait() {
        let config: KioskConfig = toml::from_str(&reuse_config(1, 2)).unwrap();
        assert_eq!(run_deadline(&config), Duration::from_secs(4));
    }
}
