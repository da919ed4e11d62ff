use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a startup failure. Drives whether a relaunch of
/// the whole app is a reasonable suggestion to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Precondition,
    PortConflict,
    LaunchTimeout,
    Spawn,
    Config,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Precondition => "precondition",
            ErrorClass::PortConflict => "port-conflict",
            ErrorClass::LaunchTimeout => "launch-timeout",
            ErrorClass::Spawn => "spawn",
            ErrorClass::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error(
        "ports exhausted: preferred ports {preferred:?} and fallback ports {fallback:?} are occupied"
    )]
    PortsExhausted { preferred: Vec<u16>, fallback: Vec<u16> },

    #[error("invalid fallback plan: {0}")]
    InvalidFallback(String),

    #[error("port {port} required by '{service}' is in use by {}", owner.as_deref().unwrap_or("an unknown process"))]
    PortInUse {
        service: String,
        port: u16,
        owner: Option<String>,
    },

    #[error("'{service}' did not become healthy at {url} within {elapsed:?} (log: {})", log_path.display())]
    LaunchTimeout {
        service: String,
        url: String,
        elapsed: Duration,
        log_path: PathBuf,
    },

    #[error(
        "'{service}' exited with {} before becoming healthy (log: {})",
        code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}")),
        log_path.display()
    )]
    ExitedEarly {
        service: String,
        code: Option<i32>,
        log_path: PathBuf,
    },

    #[error("failed to spawn '{service}' ({program})")]
    Spawn {
        service: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Config(String),
}

impl StartupError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StartupError::Precondition(_) => ErrorClass::Precondition,
            StartupError::PortsExhausted { .. }
            | StartupError::InvalidFallback(_)
            | StartupError::PortInUse { .. } => ErrorClass::PortConflict,
            StartupError::LaunchTimeout { .. } | StartupError::ExitedEarly { .. } => {
                ErrorClass::LaunchTimeout
            }
            StartupError::Spawn { .. } => ErrorClass::Spawn,
            StartupError::Config(_) => ErrorClass::Config,
        }
    }

    /// Launch timeouts and spawn failures can clear up on a fresh relaunch of
    /// the app; the rest need an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::LaunchTimeout | ErrorClass::Spawn
        )
    }

    /// Service this error is attributed to, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            StartupError::PortInUse { service, .. }
            | StartupError::LaunchTimeout { service, .. }
            | StartupError::ExitedEarly { service, .. }
            | StartupError::Spawn { service, .. } => Some(service),
            _ => None,
        }
    }
}

/// Terminal outcome of a failed orchestrator run, shared with every caller
/// attached to the run.
#[derive(Debug)]
pub struct StartupFailure {
    pub error: anyhow::Error,
    pub report_path: Option<PathBuf>,
}

impl StartupFailure {
    pub fn startup_error(&self) -> Option<&StartupError> {
        self.error.downcast_ref::<StartupError>()
    }
}

impl std::fmt::Display for StartupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.error)?;
        if let Some(path) = &self.report_path {
            write!(f, "\n\nDiagnostic report: {}", path.display())?;
        }
        Ok(())
    }
}
