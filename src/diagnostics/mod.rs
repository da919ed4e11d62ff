pub mod redact;
pub mod tail;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::config::model::DiagnosticsConfig;
use crate::config::resolve::is_packaged;
use crate::error::StartupError;
use crate::orchestrator::ports::PortPlan;
use crate::orchestrator::{OrchestratorRun, StartupPhase, Workspace};
use crate::platform;

use redact::Redactor;
use tail::{collect_tails, LogTail};

// ---------------------------------------------------------------------------
// Static checks: facts about the install that need no running process
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PathCheck {
    pub label: String,
    pub path: PathBuf,
    pub exists: bool,
}

impl PathCheck {
    fn new(label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            label: label.into(),
            exists: path.exists(),
            path,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StaticChecks {
    pub mode: &'static str,
    pub executable: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub config_path: PathBuf,
    pub env_file: Option<PathBuf>,
    pub host: String,
    pub kill_strategy: &'static str,
    pub paths: Vec<PathCheck>,
}

/// True for command strings that name a file rather than something on PATH.
fn is_path_like(command: &str) -> bool {
    !command.contains("{{") && (command.contains('/') || command.contains('\\'))
}

impl StaticChecks {
    pub fn gather(ws: &Workspace) -> Self {
        let id = &ws.identity;
        let mut paths = vec![
            PathCheck::new("config file", &id.config_path),
            PathCheck::new("state dir", &id.state_dir),
            PathCheck::new("logs dir", &id.logs_dir),
        ];
        if let Some(env_file) = ws.pool.source() {
            paths.push(PathCheck::new("env file", env_file));
        }
        if let Some(runtime) = &ws.config.runtime {
            if let Some(bundled) = &runtime.bundled {
                paths.push(PathCheck::new("bundled runtime", id.config_dir.join(bundled)));
            }
            if is_path_like(&runtime.command) {
                paths.push(PathCheck::new("runtime", id.config_dir.join(&runtime.command)));
            }
        }
        for svc in &ws.config.services {
            if let Some(cwd) = &svc.cwd {
                paths.push(PathCheck::new(format!("{} cwd", svc.name), id.config_dir.join(cwd)));
            }
            if is_path_like(&svc.command) {
                let base = crate::orchestrator::preconditions::service_cwd(
                    &id.config_dir,
                    svc.cwd.as_deref(),
                );
                paths.push(PathCheck::new(
                    format!("{} command", svc.name),
                    base.join(&svc.command),
                ));
            }
        }

        Self {
            mode: if is_packaged() { "packaged" } else { "development" },
            executable: std::env::current_exe().ok(),
            working_dir: std::env::current_dir().ok(),
            config_path: id.config_path.clone(),
            env_file: ws.pool.source().map(Path::to_path_buf),
            host: ws.config.ports.host.clone(),
            kill_strategy: platform::kill_strategy(),
            paths,
        }
    }

    pub fn missing(&self) -> impl Iterator<Item = &PathCheck> {
        self.paths.iter().filter(|p| !p.exists)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSection {
    pub message: String,
    pub class: Option<&'static str>,
    pub retryable: bool,
    pub service: Option<String>,
    pub chain: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceRow {
    pub name: String,
    pub status: &'static str,
    pub address: Option<String>,
    pub pid: Option<u32>,
    pub reused: bool,
    pub external: bool,
}

/// Everything an operator needs to diagnose a failed startup without access
/// to the machine. Secret values never appear in it.
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub project: String,
    pub created_at: DateTime<Local>,
    pub failed_in: Option<String>,
    pub elapsed_ms: u128,
    pub error: ErrorSection,
    pub services: Vec<ServiceRow>,
    pub plan: Option<PortPlan>,
    pub checks: StaticChecks,
    pub environment: BTreeMap<String, String>,
    pub tails: Vec<LogTail>,
}

/// Fence that cannot be closed by content containing triple backticks.
const FENCE: &str = "````";

impl StartupReport {
    pub fn file_name(&self) -> String {
        format!("startup-failure-{}.md", self.created_at.format("%Y%m%d-%H%M%S"))
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Startup failure: {}", self.project);
        let _ = writeln!(out);
        let _ = writeln!(out, "- When: {}", self.created_at.to_rfc3339());
        let _ = writeln!(
            out,
            "- Phase: {}",
            self.failed_in.as_deref().unwrap_or("unknown")
        );
        let _ = writeln!(out, "- Elapsed: {} ms", self.elapsed_ms);
        let _ = writeln!(
            out,
            "- Class: {} (retryable: {})",
            self.error.class.unwrap_or("unclassified"),
            if self.error.retryable { "yes" } else { "no" }
        );
        if let Some(service) = &self.error.service {
            let _ = writeln!(out, "- Service: {service}");
        }

        let _ = writeln!(out, "\n## Error\n");
        let _ = writeln!(out, "{FENCE}text");
        for (i, cause) in self.error.chain.iter().enumerate() {
            if i == 0 {
                let _ = writeln!(out, "{cause}");
            } else {
                let _ = writeln!(out, "  caused by: {cause}");
            }
        }
        let _ = writeln!(out, "{FENCE}");

        let _ = writeln!(out, "\n## Services\n");
        let _ = writeln!(out, "| Service | Status | Address | PID | Note |");
        let _ = writeln!(out, "|---|---|---|---|---|");
        for row in &self.services {
            let note = match (row.reused, row.external) {
                (_, true) => "external",
                (true, _) => "reused",
                _ => "",
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                row.name,
                row.status,
                row.address.as_deref().unwrap_or("-"),
                row.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                note
            );
        }

        let _ = writeln!(out, "\n## Port plan\n");
        match &self.plan {
            Some(plan) => {
                let _ = writeln!(out, "Tier: {}", plan.tier());
                let _ = writeln!(out);
                for (i, name) in plan.services.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "- {}: {} -> {}",
                        name,
                        plan.preferred.get(i).copied().unwrap_or_default(),
                        plan.resolved.get(i).copied().unwrap_or_default()
                    );
                }
                if !plan.occupied.is_empty() {
                    let _ = writeln!(out, "\nOccupied: {:?}", plan.occupied);
                }
            }
            None => {
                let _ = writeln!(out, "Not planned.");
            }
        }

        let c = &self.checks;
        let _ = writeln!(out, "\n## Checks\n");
        let _ = writeln!(out, "| Check | Value |");
        let _ = writeln!(out, "|---|---|");
        let opt = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".into())
        };
        let _ = writeln!(out, "| mode | {} |", c.mode);
        let _ = writeln!(out, "| executable | {} |", opt(&c.executable));
        let _ = writeln!(out, "| working dir | {} |", opt(&c.working_dir));
        let _ = writeln!(out, "| config | {} |", c.config_path.display());
        let _ = writeln!(out, "| env file | {} |", opt(&c.env_file));
        let _ = writeln!(out, "| host | {} |", c.host);
        let _ = writeln!(out, "| kill strategy | {} |", c.kill_strategy);
        let _ = writeln!(out);
        let _ = writeln!(out, "| Path | Location | Exists |");
        let _ = writeln!(out, "|---|---|---|");
        for p in &c.paths {
            let _ = writeln!(
                out,
                "| {} | {} | {} |",
                p.label,
                p.path.display(),
                if p.exists { "yes" } else { "NO" }
            );
        }

        let _ = writeln!(out, "\n## Environment (redacted)\n");
        let _ = writeln!(out, "{FENCE}text");
        for (k, v) in &self.environment {
            let _ = writeln!(out, "{k}={v}");
        }
        let _ = writeln!(out, "{FENCE}");

        let _ = writeln!(out, "\n## Log tails");
        if self.tails.is_empty() {
            let _ = writeln!(out, "\nNo logs were written.");
        }
        for tail in &self.tails {
            let _ = writeln!(
                out,
                "\n### {} ({}){}\n",
                tail.name,
                tail.path.display(),
                if tail.truncated { " [truncated]" } else { "" }
            );
            let _ = writeln!(out, "{FENCE}text");
            let _ = write!(out, "{}", tail.content);
            if !tail.content.ends_with('\n') {
                let _ = writeln!(out);
            }
            let _ = writeln!(out, "{FENCE}");
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DiagnosticsReporter {
    logs_dir: PathBuf,
    redactor: Redactor,
    tail_bytes: u64,
}

impl DiagnosticsReporter {
    pub fn new(logs_dir: PathBuf, cfg: &DiagnosticsConfig) -> Self {
        Self {
            logs_dir,
            redactor: Redactor::new(&cfg.secret_names),
            tail_bytes: cfg.tail_bytes,
        }
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Assemble the report. Secret values are redacted in the environment
    /// section and scrubbed from the error text and every log tail.
    pub fn build(
        &self,
        project: &str,
        cause: &anyhow::Error,
        run: &OrchestratorRun,
        checks: &StaticChecks,
        env: &BTreeMap<String, String>,
    ) -> StartupReport {
        let masker = self.redactor.masker(env);
        let startup = cause.downcast_ref::<StartupError>();

        let error = ErrorSection {
            message: masker.mask(&format!("{cause:#}")),
            class: startup.map(|e| e.class().as_str()),
            retryable: startup.is_some_and(StartupError::is_retryable),
            service: startup.and_then(|e| e.service()).map(String::from),
            chain: cause.chain().map(|c| masker.mask(&c.to_string())).collect(),
        };

        let services = run
            .services
            .iter()
            .map(|s| ServiceRow {
                name: s.name.clone(),
                status: s.status.as_str(),
                address: s.address.as_ref().map(|a| a.url()),
                pid: s.pid,
                reused: s.reused,
                external: s.external,
            })
            .collect();

        let tails = collect_tails(&self.logs_dir, self.tail_bytes)
            .into_iter()
            .map(|mut t| {
                t.content = masker.mask(&t.content);
                t
            })
            .collect();

        StartupReport {
            project: project.to_string(),
            created_at: Local::now(),
            failed_in: run
                .failed_in
                .or(Some(run.phase).filter(|p| *p != StartupPhase::Failed))
                .map(|p| p.to_string()),
            elapsed_ms: run.elapsed().as_millis(),
            error,
            services,
            plan: run.plan.clone(),
            checks: checks.clone(),
            environment: self.redactor.snapshot(env),
            tails,
        }
    }

    /// Build the report and write it atomically into the logs dir.
    pub fn write_report(
        &self,
        project: &str,
        cause: &anyhow::Error,
        run: &OrchestratorRun,
        checks: &StaticChecks,
        env: &BTreeMap<String, String>,
    ) -> std::io::Result<PathBuf> {
        let report = self.build(project, cause, run, checks, env);
        self.write(&report)
    }

    pub fn write(&self, report: &StartupReport) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.logs_dir)?;
        let path = unique_path(&self.logs_dir, &report.file_name());
        let tmp = path.with_extension("md.tmp");
        std::fs::write(&tmp, report.to_markdown())?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }
}

/// `name`, or `stem-N.ext` for the first N that does not exist yet.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    (1..)
        .map(|n| dir.join(format!("{stem}-{n}.{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::env::EnvPool;
    use crate::config::interpolate::ServiceAddress;
    use crate::config::model::KioskConfig;
    use crate::identity::InstanceIdentity;
    use crate::orchestrator::ServiceStatus;

    const SECRET: &str = "sk_live_0123456789abcdef";

    fn workspace(dir: &Path) -> Workspace {
        let path = dir.join("kiosk.toml");
        let toml = r#"
            [project]
            name = "clinic"
            [runtime]
            command = "java"
            bundled = "jre/bin/java"
            required_major = 17
            [[services]]
            name = "core"
            command = "./bin/core"
            port = 8080
            [[services]]
            name = "ui"
            kind = "ui"
            command = "node"
            port = 3000
        "#;
        std::fs::write(&path, toml).unwrap();
        let config: KioskConfig = toml::from_str(toml).unwrap();
        let identity = InstanceIdentity::from_config(&config, &path).unwrap();
        let pool = EnvPool::from_layers(
            BTreeMap::from([
                ("PAYMENT_SECRET_KEY".to_string(), SECRET.to_string()),
                ("APP_MODE".to_string(), "kiosk".to_string()),
            ]),
            BTreeMap::new(),
        );
        Workspace::with_env(config, identity, pool).unwrap()
    }

    fn failed_run(ws: &Workspace) -> OrchestratorRun {
        let mut run = OrchestratorRun::new(&ws.config, &["core".into(), "ui".into()]);
        run.advance(StartupPhase::BackendsStarting(0));
        run.services[0].status = ServiceStatus::Failed;
        run.services[0].address = Some(ServiceAddress::new("127.0.0.1", 8080));
        run.services[0].pid = Some(4321);
        run.fail();
        run
    }

    #[test]
    fn report_contains_cause_statuses_and_tails_without_secrets() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path());
        std::fs::create_dir_all(&ws.identity.logs_dir).unwrap();
        std::fs::write(
            ws.identity.logs_dir.join("core.log"),
            format!("booting\nconnecting with key {SECRET}\nException: bind failed\n"),
        )
        .unwrap();

        let run = failed_run(&ws);
        let reporter = DiagnosticsReporter::new(ws.identity.logs_dir.clone(), &Default::default());
        let cause = anyhow::Error::new(StartupError::LaunchTimeout {
            service: "core".into(),
            url: "http://127.0.0.1:8080/health".into(),
            elapsed: std::time::Duration::from_secs(90),
            log_path: ws.identity.logs_dir.join("core.log"),
        });
        let checks = StaticChecks::gather(&ws);
        let path = reporter
            .write_report("clinic", &cause, &run, &checks, ws.pool.vars())
            .unwrap();

        assert!(path.starts_with(&ws.identity.logs_dir));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("startup-failure-") && name.ends_with(".md"), "{name}");

        let md = std::fs::read_to_string(&path).unwrap();
        assert!(md.contains("did not become healthy"));
        assert!(md.contains("launch-timeout (retryable: yes)"));
        assert!(md.contains("- Phase: backends-starting(0)"));
        assert!(md.contains("| core | failed | http://127.0.0.1:8080 | 4321 |"));
        assert!(md.contains("| ui | not-started |"));
        assert!(md.contains("Exception: bind failed"));
        assert!(md.contains("APP_MODE=kiosk"));
        assert!(md.contains("PAYMENT_SECRET_KEY=sk_l…ef (24 chars)"));
        assert!(!md.contains(SECRET), "secret leaked into report");
        assert!(!tmp.path().join(".kiosk/logs").read_dir().unwrap().any(|e| {
            e.unwrap().path().extension().is_some_and(|x| x == "tmp")
        }));
    }

    #[test]
    fn same_second_reports_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path());
        let run = failed_run(&ws);
        let reporter = DiagnosticsReporter::new(ws.identity.logs_dir.clone(), &Default::default());
        let checks = StaticChecks::gather(&ws);
        let cause = anyhow::anyhow!("boom");

        let mut report = reporter.build("clinic", &cause, &run, &checks, ws.pool.vars());
        let first = reporter.write(&report).unwrap();
        report.error.message = "again".into();
        let second = reporter.write(&report).unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("-1.md"));
        assert!(std::fs::read_to_string(&second).unwrap().contains("unclassified"));
    }

    #[test]
    fn static_checks_flag_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path());
        let checks = StaticChecks::gather(&ws);

        let missing: Vec<&str> = checks.missing().map(|p| p.label.as_str()).collect();
        assert!(missing.contains(&"bundled runtime"), "{missing:?}");
        assert!(missing.contains(&"core command"), "{missing:?}");
        assert!(!missing.contains(&"config file"));
        assert!(!checks.paths.iter().any(|p| p.label == "ui command"));
    }
}
