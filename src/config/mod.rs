pub mod env;
pub mod interpolate;
pub mod model;
pub mod overrides;
pub mod resolve;
pub mod validate;

use std::path::Path;

use anyhow::{bail, Context};

use model::KioskConfig;

/// Read and parse a config file, returning the parsed config together with
/// the raw source (needed for diagnostics spans).
pub fn load_config(path: &Path) -> anyhow::Result<(KioskConfig, String)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: KioskConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
    Ok((config, content))
}

/// Load a config file and reject it if validation finds any problem.
pub fn load_validated(path: &Path) -> anyhow::Result<KioskConfig> {
    let (config, source) = load_config(path)?;
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| resolve::CONFIG_FILENAME.to_string());

    if let Err(errors) = validate::validate(&config, &source, &filename) {
        let mut msg = String::from("Configuration errors:\n");
        for err in &errors {
            msg.push_str(&format!("  - {}\n", err));
        }
        bail!("{}", msg.trim_end());
    }
    Ok(config)
}
