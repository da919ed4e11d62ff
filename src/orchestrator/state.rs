use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::orchestrator::ports::PortPlan;

/// Directory (next to the config file) holding state, logs and the lock.
pub const STATE_DIR: &str = ".kiosk";
const STATE_FILE: &str = "state.json";

/// What the running instance publishes for `ps`, `stop` and late launchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub slug: String,
    pub config_path: String,
    /// PID of the orchestrating process.
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub phase: String,
    #[serde(default)]
    pub plan: Option<PortPlan>,
    #[serde(default)]
    pub ui_url: Option<String>,
    #[serde(default)]
    pub report_path: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    /// `None` when an existing server was reused.
    pub pid: Option<u32>,
    pub host: String,
    pub port: u16,
    pub reused: bool,
    #[serde(default)]
    pub ui: bool,
}

impl InstanceState {
    pub fn new(slug: &str, config_path: &Path) -> Self {
        Self {
            slug: slug.to_string(),
            config_path: config_path.display().to_string(),
            pid: std::process::id(),
            started_at: Utc::now(),
            phase: "starting".to_string(),
            plan: None,
            ui_url: None,
            report_path: None,
            services: BTreeMap::new(),
        }
    }

    pub fn state_dir_for(config_dir: &Path) -> PathBuf {
        config_dir.join(STATE_DIR)
    }

    pub fn logs_dir_for(state_dir: &Path) -> PathBuf {
        state_dir.join("logs")
    }

    pub fn save(&self, state_dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(STATE_FILE);
        let content = serde_json::to_string_pretty(self)?;
        // Atomic write: write to tmp file then rename
        let tmp_path = state_dir.join("state.json.tmp");
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn load(state_dir: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(state_dir.join(STATE_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn remove(state_dir: &Path) -> anyhow::Result<()> {
        let path = state_dir.join(STATE_FILE);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Acquire an exclusive file lock on state.json.lock.
    /// Returns the lock file handle (lock released on drop).
    fn lock_state(state_dir: &Path) -> Option<std::fs::File> {
        let lock_file = std::fs::File::create(state_dir.join("state.json.lock")).ok()?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: fd is valid for the lifetime of lock_file
            unsafe {
                libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX);
            }
        }

        Some(lock_file)
    }

    /// Read-modify-write under the state lock. A missing state file is left
    /// alone.
    pub fn update(state_dir: &Path, f: impl FnOnce(&mut InstanceState)) {
        let _lock = Self::lock_state(state_dir);
        if let Some(mut state) = Self::load(state_dir) {
            f(&mut state);
            if let Err(e) = state.save(state_dir) {
                tracing::warn!(error = %e, "failed to update state.json");
            }
        }
    }

    /// Record a relaunched process for `service`.
    pub fn update_service_pid(state_dir: &Path, service: &str, pid: Option<u32>) {
        Self::update(state_dir, |state| {
            if let Some(svc) = state.services.get_mut(service) {
                svc.pid = pid;
                svc.reused = pid.is_none();
            }
        });
    }

    pub fn ui_service(&self) -> Option<(&String, &ServiceState)> {
        self.services.iter().find(|(_, s)| s.ui)
    }
}
