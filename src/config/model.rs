use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct KioskConfig {
    pub project: ProjectConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub env_file: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    #[default]
    Backend,
    Ui,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_health")]
    pub health: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub kind: ServiceKind,
}

impl ServiceConfig {
    pub fn is_ui(&self) -> bool {
        self.kind == ServiceKind::Ui
    }
}

fn default_health() -> String {
    "/health".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ui_scan_window() -> u16 {
    21
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PortsConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub fallback_base: Option<u16>,
    #[serde(default = "default_ui_scan_window")]
    pub ui_scan_window: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            fallback_base: None,
            ui_scan_window: default_ui_scan_window(),
        }
    }
}

/// Deserialize a humantime string such as `"90s"` or `"300ms"`.
fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_ui_health_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_reachable_timeout() -> Duration {
    Duration::from_millis(800)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(300)
}

fn default_tcp_probe() -> Duration {
    Duration::from_millis(250)
}

fn default_kill_grace() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TimeoutsConfig {
    #[serde(default = "default_health_timeout", deserialize_with = "de_duration")]
    pub health: Duration,
    #[serde(default = "default_ui_health_timeout", deserialize_with = "de_duration")]
    pub ui_health: Duration,
    #[serde(default = "default_reachable_timeout", deserialize_with = "de_duration")]
    pub reachable: Duration,
    #[serde(default = "default_poll_interval", deserialize_with = "de_duration")]
    pub poll_interval: Duration,
    #[serde(default = "default_tcp_probe", deserialize_with = "de_duration")]
    pub tcp_probe: Duration,
    #[serde(default = "default_kill_grace", deserialize_with = "de_duration")]
    pub kill_grace: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            health: default_health_timeout(),
            ui_health: default_ui_health_timeout(),
            reachable: default_reachable_timeout(),
            poll_interval: default_poll_interval(),
            tcp_probe: default_tcp_probe(),
            kill_grace: default_kill_grace(),
        }
    }
}

fn default_version_args() -> Vec<String> {
    vec!["-version".to_string()]
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    pub command: String,
    #[serde(default)]
    pub bundled: Option<String>,
    #[serde(default = "default_version_args")]
    pub version_args: Vec<String>,
    pub required_major: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub required: BTreeMap<String, Vec<String>>,
}

fn default_true() -> bool {
    true
}

fn default_recovery_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RecoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_recovery_delay", deserialize_with = "de_duration")]
    pub delay: Duration,
    #[serde(default = "default_monitor_interval", deserialize_with = "de_duration")]
    pub monitor_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: default_recovery_delay(),
            monitor_interval: default_monitor_interval(),
        }
    }
}

fn default_tail_bytes() -> u64 {
    16 * 1024
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_tail_bytes")]
    pub tail_bytes: u64,
    #[serde(default)]
    pub secret_names: Vec<String>,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            tail_bytes: default_tail_bytes(),
            secret_names: Vec::new(),
        }
    }
}

impl KioskConfig {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Backend services in declared order.
    pub fn backends(&self) -> impl Iterator<Item = &ServiceConfig> {
        self.services.iter().filter(|s| !s.is_ui())
    }

    pub fn ui_service(&self) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.is_ui())
    }
}
