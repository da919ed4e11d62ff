use std::path::{Path, PathBuf};

pub const CONFIG_FILENAME: &str = "kiosk.toml";

/// Variable naming the config file when no `--file` flag is given.
pub const CONFIG_VAR: &str = "KIOSK_CONFIG";

/// Walk up the directory tree from `start`, checking for `filename` at each level.
pub fn find_config(start: &Path, filename: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(filename))
        .find(|candidate| candidate.is_file())
}

/// Config shipped next to the installed executable (packaged kiosk builds).
fn packaged_config() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.parent()?.join(CONFIG_FILENAME);
    candidate.is_file().then_some(candidate)
}

/// Resolve the config file path.
///
/// Order: `--file`, `KIOSK_CONFIG`, upward search from the working directory,
/// then the directory of the running executable.
pub fn resolve_config(cli_file: Option<&Path>) -> anyhow::Result<PathBuf> {
    let explicit = cli_file
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_VAR).map(PathBuf::from));

    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.canonicalize()?);
        }
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let cwd = std::env::current_dir()?;
    find_config(&cwd, CONFIG_FILENAME)
        .or_else(packaged_config)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No {} found in {} or any parent directory, nor next to the executable",
                CONFIG_FILENAME,
                cwd.display()
            )
        })
}

/// Whether this binary runs from a packaged install rather than a build tree.
pub fn is_packaged() -> bool {
    if cfg!(debug_assertions) {
        return false;
    }
    std::env::current_exe()
        .ok()
        .map(|exe| {
            !exe.components()
                .any(|c| c.as_os_str() == "target")
        })
        .unwrap_or(false)
}
