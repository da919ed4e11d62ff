use tokio::process::Command;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use unix as imp;
#[cfg(windows)]
use windows as imp;

/// How hard to hit a process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    /// Ask politely (SIGTERM / `taskkill /T`).
    Graceful,
    /// No negotiation (SIGKILL / `taskkill /T /F`).
    Force,
}

/// Configure the command to run in its own process group so the whole tree
/// can be signalled later.
/// Unix: `process_group(0)`, Windows: `CREATE_NEW_PROCESS_GROUP`
pub fn configure_process_group(cmd: &mut Command) {
    imp::configure_process_group(cmd)
}

/// Terminate `pid` and every descendant.
/// Unix: signal the process group. Windows: `taskkill /T`.
/// A tree that is already gone is not an error.
pub async fn kill_tree(pid: u32, mode: KillMode) -> std::io::Result<()> {
    imp::kill_tree(pid, mode).await
}

/// Ask a single process (not its group) to shut down cleanly.
/// Unix: SIGTERM. Windows: `taskkill /T /F`, consoles ignore anything softer.
pub async fn request_shutdown(pid: u32) -> std::io::Result<()> {
    imp::request_shutdown(pid).await
}

/// Check if a process with the given PID is still alive.
pub fn is_process_alive(pid: u32) -> bool {
    imp::is_process_alive(pid)
}

/// Identify which process owns a given TCP port.
pub fn identify_port_owner(port: u16) -> Option<String> {
    imp::identify_port_owner(port)
}

/// Short name of the tree-kill strategy in use, for diagnostics.
pub fn kill_strategy() -> &'static str {
    imp::KILL_STRATEGY
}
