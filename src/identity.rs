use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::model::KioskConfig;
use crate::orchestrator::state::InstanceState;

/// Where one kiosk install lives on disk and what it is called.
#[derive(Debug, Clone)]
pub struct InstanceIdentity {
    pub name: String,
    pub id: String,
    pub slug: String,
    pub config_path: PathBuf,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
}

/// First 8 hex characters of the SHA-256 of the path string. The path is
/// hashed as given; canonicalize first for a stable id.
pub fn compute_instance_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let hash = hasher.finalize();
    hex::encode(&hash[..4])
}

impl InstanceIdentity {
    /// The config path is canonicalized so two launches through different
    /// relative paths agree on the same state directory.
    pub fn from_config(config: &KioskConfig, config_path: &Path) -> anyhow::Result<Self> {
        let canonical = config_path.canonicalize()?;
        let config_dir = canonical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let state_dir = InstanceState::state_dir_for(&config_dir);
        let logs_dir = InstanceState::logs_dir_for(&state_dir);
        let name = config.project.name.clone();
        let id = compute_instance_id(&canonical);

        Ok(Self {
            slug: format!("{name}-{id}"),
            name,
            id,
            config_path: canonical,
            config_dir,
            state_dir,
            logs_dir,
        })
    }
}
