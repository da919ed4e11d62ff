use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Variable naming an explicit env file. Beats every conventional location.
pub const ENV_FILE_VAR: &str = "KIOSK_ENV_FILE";

// ---------------------------------------------------------------------------
// .env file parser
// ---------------------------------------------------------------------------

/// Parse a `.env` file into key-value pairs.
///
/// Supports: `KEY=VALUE`, `KEY="VALUE"`, `KEY='VALUE'`, `export KEY=VALUE`,
/// `# comments`, blank lines.
pub fn parse_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading env file {}", path.display()))?;

    parse_env_content(&content)
        .with_context(|| format!("parsing env file {}", path.display()))
}

pub fn parse_env_content(content: &str) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();

    for (line_num, line) in content.lines().enumerate() {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);

        let Some((key, value)) = trimmed.split_once('=') else {
            bail!(
                "line {}: expected KEY=VALUE, got {:?}",
                line_num + 1,
                trimmed
            );
        };

        let key = key.trim().to_string();
        if key.is_empty() {
            bail!("line {}: empty key", line_num + 1);
        }

        let value = value.trim();

        // Strip matching quotes
        let value = if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            &value[1..value.len() - 1]
        } else {
            value
        };

        vars.insert(key, value.to_string());
    }

    Ok(vars)
}

// ---------------------------------------------------------------------------
// Env file discovery
// ---------------------------------------------------------------------------

/// Candidate env-file locations, highest precedence first:
/// 1. `KIOSK_ENV_FILE` (must exist when set)
/// 2. `project.env_file` relative to the config directory
/// 3. `<config dir>/.env`
/// 4. `<user config dir>/kioskboot/.env`
pub fn env_file_candidates(
    explicit: Option<&Path>,
    project_env_file: Option<&str>,
    config_dir: &Path,
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    if let Some(rel) = project_env_file {
        candidates.push(config_dir.join(rel));
    }
    candidates.push(config_dir.join(".env"));
    if let Some(user_dir) = dirs::config_dir() {
        candidates.push(user_dir.join("kioskboot").join(".env"));
    }
    candidates
}

/// Locate the env file to load. An explicit path that does not exist is an
/// error; conventional locations are silently skipped.
pub fn discover_env_file(
    explicit: Option<&Path>,
    project_env_file: Option<&str>,
    config_dir: &Path,
) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.is_file() {
            bail!("{} points at missing file {}", ENV_FILE_VAR, path.display());
        }
        return Ok(Some(path.to_path_buf()));
    }
    Ok(env_file_candidates(None, project_env_file, config_dir)
        .into_iter()
        .find(|p| p.is_file()))
}

// ---------------------------------------------------------------------------
// EnvPool: the environment every service and precondition sees
// ---------------------------------------------------------------------------

/// Process environment layered over the env file. The process wins so an
/// operator can always override a packaged `.env`.
#[derive(Debug, Clone, Default)]
pub struct EnvPool {
    vars: BTreeMap<String, String>,
    source: Option<PathBuf>,
}

impl EnvPool {
    pub fn new(file_vars: BTreeMap<String, String>, source: Option<PathBuf>) -> Self {
        let mut vars = file_vars;
        vars.extend(std::env::vars());
        Self { vars, source }
    }

    /// Build from explicit layers without consulting the process environment.
    pub fn from_layers(
        file_vars: BTreeMap<String, String>,
        process_vars: BTreeMap<String, String>,
    ) -> Self {
        let mut vars = file_vars;
        vars.extend(process_vars);
        Self { vars, source: None }
    }

    pub fn load(
        explicit: Option<&Path>,
        project_env_file: Option<&str>,
        config_dir: &Path,
    ) -> Result<Self> {
        let path = discover_env_file(explicit, project_env_file, config_dir)?;
        let file_vars = match &path {
            Some(p) => {
                tracing::debug!(path = %p.display(), "loading env file");
                parse_env_file(p)?
            }
            None => BTreeMap::new(),
        };
        Ok(Self::new(file_vars, path))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// True when the variable is set to a truthy value (`1`, `true`, `yes`, `on`).
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}
