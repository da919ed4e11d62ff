use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::env::EnvPool;
use crate::config::model::{CredentialsConfig, KioskConfig, RuntimeConfig};
use crate::config::overrides::Overrides;
use crate::error::StartupError;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)version\s+"?v?(\d+)(?:\.(\d+))?"#).expect("version regex must compile")
});

static BARE_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bv?(\d+)\.(\d+)").expect("version regex must compile"));

/// Major version from `-version` style output. Legacy `1.x` numbering maps
/// to `x`.
pub fn parse_major_version(output: &str) -> Option<u32> {
    let caps = VERSION_RE
        .captures(output)
        .or_else(|| BARE_VERSION_RE.captures(output))?;
    let major: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minor: Option<u32> = caps.get(2).and_then(|m| m.as_str().parse().ok());
    match (major, minor) {
        (1, Some(minor)) => Some(minor),
        _ => Some(major),
    }
}

/// The runtime executable services will use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRuntime {
    pub path: String,
    pub major: Option<u32>,
    /// The version requirement was actually verified.
    pub verified: bool,
}

/// Everything the precondition phase established.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PreconditionReport {
    pub runtime: Option<ResolvedRuntime>,
    pub tier: Option<String>,
    pub credentials_checked: Vec<String>,
}

fn resolve_relative(config_dir: &Path, raw: &str) -> String {
    let path = Path::new(raw);
    if path.is_absolute() || path.components().count() == 1 {
        // Absolute, or a bare name resolved through PATH.
        raw.to_string()
    } else {
        config_dir.join(path).to_string_lossy().to_string()
    }
}

/// Candidate executables: the bundled runtime first, then `command`.
pub fn runtime_candidates(cfg: &RuntimeConfig, config_dir: &Path) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(bundled) = &cfg.bundled {
        let path = config_dir.join(bundled);
        if path.is_file() {
            candidates.push(path.to_string_lossy().to_string());
        } else {
            debug!(path = %path.display(), "no bundled runtime");
        }
    }
    candidates.push(resolve_relative(config_dir, &cfg.command));
    candidates
}

async fn probe_version(program: &str, args: &[String]) -> Result<String, String> {
    let output = tokio::time::timeout(
        VERSION_PROBE_TIMEOUT,
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| format!("{program} did not report a version within {VERSION_PROBE_TIMEOUT:?}"))?
    .map_err(|e| format!("{program}: {e}"))?;

    // Java prints its version banner on stderr.
    let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stdout));
    Ok(text)
}

/// Find a runtime of exactly the required major version.
pub async fn check_runtime(
    cfg: &RuntimeConfig,
    config_dir: &Path,
) -> Result<ResolvedRuntime, StartupError> {
    let mut problems = Vec::new();
    for candidate in runtime_candidates(cfg, config_dir) {
        match probe_version(&candidate, &cfg.version_args).await {
            Ok(output) => match parse_major_version(&output) {
                Some(major) if major == cfg.required_major => {
                    info!(runtime = %candidate, major, "runtime ok");
                    return Ok(ResolvedRuntime {
                        path: candidate,
                        major: Some(major),
                        verified: true,
                    });
                }
                Some(major) => problems.push(format!("{candidate} is version {major}")),
                None => problems.push(format!("{candidate} reported no version")),
            },
            Err(e) => problems.push(e),
        }
    }
    Err(StartupError::Precondition(format!(
        "runtime {} required: {}",
        cfg.required_major,
        problems.join("; ")
    )))
}

/// First candidate, unverified. Used when the check is switched off.
pub fn unchecked_runtime(cfg: &RuntimeConfig, config_dir: &Path) -> ResolvedRuntime {
    let path = runtime_candidates(cfg, config_dir)
        .into_iter()
        .next()
        .unwrap_or_else(|| cfg.command.clone());
    ResolvedRuntime {
        path,
        major: None,
        verified: false,
    }
}

/// Credential tier in effect: the override wins over the config.
pub fn active_tier(cfg: &CredentialsConfig, overrides: &Overrides) -> Option<String> {
    overrides.env_tier.clone().or_else(|| cfg.tier.clone())
}

/// Every variable the tier requires must be present and non-empty. Returns
/// the names that were checked; values are never reported.
pub fn check_credentials(
    cfg: &CredentialsConfig,
    tier: Option<&str>,
    pool: &EnvPool,
) -> Result<Vec<String>, StartupError> {
    let Some(tier) = tier else {
        return Ok(Vec::new());
    };
    let Some(required) = cfg.required.get(tier) else {
        warn!(tier, "no credential requirements for tier");
        return Ok(Vec::new());
    };
    let missing: Vec<&str> = required
        .iter()
        .filter(|name| pool.get(name).is_none_or(|v| v.trim().is_empty()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(StartupError::Precondition(format!(
            "missing credentials for tier '{}': {}",
            tier,
            missing.join(", ")
        )));
    }
    Ok(required.clone())
}

/// Run every hard requirement. Nothing has been spawned yet, so a failure
/// here needs no cleanup.
pub async fn check_all(
    config: &KioskConfig,
    config_dir: &Path,
    pool: &EnvPool,
    overrides: &Overrides,
) -> Result<PreconditionReport, StartupError> {
    let runtime = match &config.runtime {
        Some(cfg) if overrides.skip_runtime_check => {
            warn!("runtime check skipped");
            Some(unchecked_runtime(cfg, config_dir))
        }
        Some(cfg) => Some(check_runtime(cfg, config_dir).await?),
        None => None,
    };

    let (tier, credentials_checked) = match &config.credentials {
        Some(cfg) => {
            let tier = active_tier(cfg, overrides);
            let checked = check_credentials(cfg, tier.as_deref(), pool)?;
            (tier, checked)
        }
        None => (None, Vec::new()),
    };

    Ok(PreconditionReport {
        runtime,
        tier,
        credentials_checked,
    })
}

/// Working directory of a service: relative paths hang off the config dir.
pub fn service_cwd(config_dir: &Path, cwd: Option<&str>) -> PathBuf {
    match cwd {
        Some(dir) => config_dir.join(dir),
        None => config_dir.to_path_buf(),
    }
}
