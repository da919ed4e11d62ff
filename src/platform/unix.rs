use tokio::process::Command;
use tracing::debug;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use super::KillMode;

pub const KILL_STRATEGY: &str = "killpg";

pub fn configure_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

pub async fn kill_tree(pid: u32, mode: KillMode) -> std::io::Result<()> {
    let signal = match mode {
        KillMode::Graceful => Signal::SIGTERM,
        KillMode::Force => Signal::SIGKILL,
    };
    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, signal) {
        Ok(()) => {
            debug!(pid, ?signal, "signalled process group");
            Ok(())
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!(pid, "process group already exited");
            Ok(())
        }
        Err(e) => Err(std::io::Error::from_raw_os_error(e as i32)),
    }
}

pub async fn request_shutdown(pid: u32) -> std::io::Result<()> {
    match nix::sys::signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from_raw_os_error(e as i32)),
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(target_os = "linux")]
pub fn identify_port_owner(port: u16) -> Option<String> {
    let port_hex = format!("{:04X}", port);

    let mut target_inode: Option<String> = None;
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(content) = std::fs::read_to_string(table) else {
            continue;
        };
        // Only listening sockets (state 0A) own the port.
        target_inode = content.lines().skip(1).find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != "0A" {
                return None;
            }
            let local_port = fields[1].rsplit(':').next()?;
            (local_port == port_hex).then(|| fields[9].to_string())
        });
        if target_inode.is_some() {
            break;
        }
    }

    let inode = target_inode.filter(|i| i != "0")?;
    let needle = format!("socket:[{}]", inode);

    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let pid_str = entry.file_name().to_string_lossy().to_string();
        if !pid_str.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Ok(fds) = std::fs::read_dir(format!("/proc/{}/fd", pid_str)) else {
            continue;
        };
        let owns = fds
            .flatten()
            .filter_map(|fd| std::fs::read_link(fd.path()).ok())
            .any(|link| link.to_string_lossy() == needle);
        if !owns {
            continue;
        }
        let cmd = std::fs::read(format!("/proc/{}/cmdline", pid_str))
            .map(|c| String::from_utf8_lossy(&c).replace('\0', " ").trim().to_string())
            .unwrap_or_default();
        return Some(describe_owner(&cmd, &pid_str));
    }

    None
}

/// `cmdline (PID n)`, with long command lines cut to 60 characters.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn describe_owner(cmd: &str, pid: &str) -> String {
    match cmd.chars().count() {
        0 => format!("PID {}", pid),
        n if n > 60 => format!("{}... (PID {})", cmd.chars().take(57).collect::<String>(), pid),
        _ => format!("{} (PID {})", cmd, pid),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn identify_port_owner(_port: u16) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn kill_tree_reaches_grandchildren() {
        let mut cmd = Command::new("sh");
        // The inner sleep is a grandchild that would survive a plain kill(pid).
        cmd.arg("-c").arg("sleep 60 & echo $! ; wait");
        cmd.stdout(std::process::Stdio::piped());
        configure_process_group(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(child.stdout.take().unwrap()).lines();
        let grandchild: u32 = lines.next_line().await.unwrap().unwrap().trim().parse().unwrap();
        assert!(is_process_alive(grandchild));

        kill_tree(pid, KillMode::Force).await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;

        let mut gone = false;
        for _ in 0..50 {
            // A zombie still answers kill(0); the reparented child gets reaped by init.
            if !is_process_alive(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(gone, "grandchild {grandchild} survived the tree kill");
    }

    #[test]
    fn owner_description_cuts_on_char_boundaries() {
        let cmd = format!("node {}", "ü".repeat(80));
        let described = describe_owner(&cmd, "42");
        assert!(described.ends_with("... (PID 42)"), "{described}");
        assert_eq!(described.trim_end_matches("... (PID 42)").chars().count(), 57);
        assert_eq!(describe_owner("", "7"), "PID 7");
        assert_eq!(describe_owner("sleep 60", "7"), "sleep 60 (PID 7)");
    }

    #[tokio::test]
    async fn kill_tree_of_missing_group_is_ok() {
        // PID far above any default pid_max.
        kill_tree(4_000_000, KillMode::Graceful).await.unwrap();
    }
}
