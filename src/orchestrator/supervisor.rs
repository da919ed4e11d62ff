use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::StartupError;
use crate::platform::{self, KillMode};
use crate::ui::logs::{LogLine, LogSink};

/// Exit history kept for diagnostics and the crash monitor.
const EXIT_HISTORY: usize = 64;

/// How long the exit observer waits for buffered output after an exit.
const PUMP_DRAIN: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Handles and events
// ---------------------------------------------------------------------------

/// A spawned service process. Only the supervisor holds these; everyone else
/// looks them up by service name and must expect them to vanish on exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub service: String,
    pub pid: u32,
    pub log_path: PathBuf,
    /// `None` while running.
    pub exit_code: Option<i32>,
}

/// Published once per process exit, after the handle left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub service: String,
    pub pid: u32,
    pub code: Option<i32>,
    /// The supervisor itself asked the process to stop.
    pub requested: bool,
}

/// Everything needed to start one process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub service: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

struct Entry {
    handle: ProcessHandle,
    exited: CancellationToken,
    stopping: bool,
}

struct Inner {
    logs_dir: PathBuf,
    kill_grace: Duration,
    registry: Mutex<BTreeMap<String, Entry>>,
    history: Mutex<VecDeque<ProcessHandle>>,
    spawns: AtomicUsize,
    log_tx: broadcast::Sender<LogLine>,
    exit_tx: broadcast::Sender<ExitEvent>,
    tracker: TaskTracker,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns every process the orchestrator starts. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(logs_dir: impl Into<PathBuf>, kill_grace: Duration) -> Self {
        let (log_tx, _) = broadcast::channel(1024);
        let (exit_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                logs_dir: logs_dir.into(),
                kill_grace,
                registry: Mutex::new(BTreeMap::new()),
                history: Mutex::new(VecDeque::new()),
                spawns: AtomicUsize::new(0),
                log_tx,
                exit_tx,
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.inner.logs_dir
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Entry>> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogLine> {
        self.inner.log_tx.subscribe()
    }

    pub fn subscribe_exits(&self) -> broadcast::Receiver<ExitEvent> {
        self.inner.exit_tx.subscribe()
    }

    /// Number of successful spawns over the supervisor's lifetime.
    pub fn spawn_count(&self) -> usize {
        self.inner.spawns.load(Ordering::SeqCst)
    }

    pub fn handle(&self, service: &str) -> Option<ProcessHandle> {
        self.registry().get(service).map(|e| e.handle.clone())
    }

    /// Snapshot of every registered handle, by service name.
    pub fn handles(&self) -> Vec<ProcessHandle> {
        self.registry().values().map(|e| e.handle.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.registry().is_empty()
    }

    /// Most recent exit recorded for `service`.
    pub fn last_exit(&self, service: &str) -> Option<ProcessHandle> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .find(|h| h.service == service)
            .cloned()
    }

    /// Start a process for `req.service`. Output of both streams goes to the
    /// service's log file and to log subscribers.
    pub async fn spawn(&self, req: SpawnRequest) -> Result<ProcessHandle, StartupError> {
        let spawn_err = |source: std::io::Error| StartupError::Spawn {
            service: req.service.clone(),
            program: req.program.clone(),
            source,
        };

        if self.registry().contains_key(&req.service) {
            return Err(spawn_err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "a process for this service is still registered",
            )));
        }

        let sink = Arc::new(
            LogSink::open(&self.inner.logs_dir, &req.service)
                .await
                .map_err(spawn_err)?,
        );

        let mut cmd = Command::new(&req.program);
        cmd.args(&req.args)
            .envs(&req.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &req.cwd {
            cmd.current_dir(dir);
        }
        platform::configure_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id().unwrap_or_default();
        self.inner.spawns.fetch_add(1, Ordering::SeqCst);
        info!(service = %req.service, pid, program = %req.program, "spawned");

        if let Err(e) = sink
            .mark(
                &req.service,
                format!("spawned pid {pid}: {} {}", req.program, req.args.join(" ")),
            )
            .await
        {
            warn!(service = %req.service, error = %e, "log write failed");
        }

        let pumps = [
            child
                .stdout
                .take()
                .map(|out| self.pump(&req.service, out, sink.clone(), false)),
            child
                .stderr
                .take()
                .map(|err| self.pump(&req.service, err, sink.clone(), true)),
        ];

        let handle = ProcessHandle {
            service: req.service.clone(),
            pid,
            log_path: sink.path().to_path_buf(),
            exit_code: None,
        };
        let exited = CancellationToken::new();
        self.registry().insert(
            req.service.clone(),
            Entry {
                handle: handle.clone(),
                exited: exited.clone(),
                stopping: false,
            },
        );

        // Exit observer: record the code, drop the handle, then announce.
        let this = self.clone();
        let service = req.service;
        self.inner.tracker.spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(service = %service, error = %e, "wait() failed");
                    None
                }
            };
            // Background children may hold the pipes open; do not wait on
            // them forever.
            for pump in pumps.into_iter().flatten() {
                let _ = tokio::time::timeout(PUMP_DRAIN, pump).await;
            }
            if let Err(e) = sink
                .mark(&service, format!("pid {pid} exited with code {code:?}"))
                .await
            {
                warn!(service = %service, error = %e, "log write failed");
            }
            this.record_exit(&service, pid, code);
            exited.cancel();
        });

        Ok(handle)
    }

    fn pump<R>(
        &self,
        service: &str,
        stream: R,
        sink: Arc<LogSink>,
        is_stderr: bool,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.inner.log_tx.clone();
        let service = service.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(text)) => {
                        let line = LogLine::new(&service, text, is_stderr);
                        if let Err(e) = sink.write(&line).await {
                            warn!(service = %service, error = %e, "log write failed");
                        }
                        let _ = tx.send(line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(service = %service, error = %e, "output read error");
                        break;
                    }
                }
            }
        })
    }

    fn record_exit(&self, service: &str, pid: u32, code: Option<i32>) {
        let removed = {
            let mut registry = self.registry();
            match registry.get(service) {
                Some(entry) if entry.handle.pid == pid => registry.remove(service),
                _ => None,
            }
        };
        let requested = removed.as_ref().is_some_and(|e| e.stopping);
        let mut handle = removed.map(|e| e.handle).unwrap_or_else(|| ProcessHandle {
            service: service.to_string(),
            pid,
            log_path: crate::ui::logs::service_log_path(&self.inner.logs_dir, service),
            exit_code: None,
        });
        handle.exit_code = code;

        {
            let mut history = self
                .inner
                .history
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if history.len() == EXIT_HISTORY {
                history.pop_front();
            }
            history.push_back(handle);
        }

        if requested {
            debug!(service, pid, ?code, "stopped");
        } else {
            warn!(service, pid, ?code, "process exited");
        }
        let _ = self.inner.exit_tx.send(ExitEvent {
            service: service.to_string(),
            pid,
            code,
            requested,
        });
    }

    /// Terminate the service's process and all of its descendants. Returns
    /// once the handle has left the registry. Unknown services are a no-op.
    pub async fn kill_tree(&self, service: &str) -> std::io::Result<()> {
        let (pid, exited) = {
            let mut registry = self.registry();
            let Some(entry) = registry.get_mut(service) else {
                return Ok(());
            };
            entry.stopping = true;
            (entry.handle.pid, entry.exited.clone())
        };
        let grace = self.inner.kill_grace;

        debug!(service, pid, "terminating process tree");
        let graceful = platform::kill_tree(pid, KillMode::Graceful).await;
        if graceful.is_err()
            || tokio::time::timeout(grace, exited.cancelled()).await.is_err()
        {
            warn!(service, pid, "process tree ignored graceful stop, forcing");
            platform::kill_tree(pid, KillMode::Force).await?;
            if tokio::time::timeout(grace, exited.cancelled()).await.is_err() {
                // The observer never fired; forget the handle anyway so the
                // registry reflects that we gave up on it.
                warn!(service, pid, "process did not exit after forced kill");
                self.record_exit(service, pid, None);
            }
        }

        // Sweep descendants that outlived the group leader.
        #[cfg(unix)]
        platform::kill_tree(pid, KillMode::Force).await?;

        Ok(())
    }

    /// Tree-kill every registered process. Never fails: individual kill
    /// errors are logged and skipped.
    pub async fn kill_all(&self) {
        let services: Vec<String> = self.registry().keys().cloned().collect();
        if services.is_empty() {
            return;
        }
        info!(count = services.len(), "stopping all processes");
        let kills = services.iter().map(|name| async move {
            if let Err(e) = self.kill_tree(name).await {
                warn!(service = %name, error = %e, "kill failed");
            }
        });
        futures_util::future::join_all(kills).await;
    }

    /// Wait for every exit observer to finish. Call after `kill_all`.
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}
