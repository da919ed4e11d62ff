use tokio::process::Command;
use tracing::debug;

use windows_sys::Win32::Foundation::CloseHandle;
use windows_sys::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, CREATE_NEW_PROCESS_GROUP, PROCESS_QUERY_LIMITED_INFORMATION,
};

use super::KillMode;

pub const KILL_STRATEGY: &str = "taskkill /T";

const STILL_ACTIVE: u32 = 259;

/// taskkill exit code when the PID no longer exists.
const TASKKILL_NOT_FOUND: i32 = 128;

pub fn configure_process_group(cmd: &mut Command) {
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

pub async fn kill_tree(pid: u32, mode: KillMode) -> std::io::Result<()> {
    let mut cmd = Command::new("taskkill");
    cmd.arg("/PID").arg(pid.to_string()).arg("/T");
    if mode == KillMode::Force {
        cmd.arg("/F");
    }
    let output = cmd.output().await?;
    match output.status.code() {
        Some(0) => {
            debug!(pid, ?mode, "taskkill succeeded");
            Ok(())
        }
        Some(TASKKILL_NOT_FOUND) => {
            debug!(pid, "process tree already exited");
            Ok(())
        }
        _ => Err(std::io::Error::other(format!(
            "taskkill /PID {} failed: {}",
            pid,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

pub async fn request_shutdown(pid: u32) -> std::io::Result<()> {
    kill_tree(pid, KillMode::Force).await
}

pub fn is_process_alive(pid: u32) -> bool {
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut exit_code: u32 = 0;
        let result = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle);
        result != 0 && exit_code == STILL_ACTIVE
    }
}

pub fn identify_port_owner(_port: u16) -> Option<String> {
    None
}
