use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

use crate::orchestrator::run::InstanceLock;
use crate::orchestrator::state::InstanceState;
use crate::platform::{self, KillMode};

const STOP_TIMEOUT: Duration = Duration::from_secs(15);
const POLL: Duration = Duration::from_millis(200);

/// Ask the orchestrating process to shut down, then sweep up any service it
/// left behind. Pids are only trusted while their orchestrator holds the
/// instance lock.
pub async fn run(config_file: Option<&Path>) -> Result<()> {
    let state_dir = super::ps::state_dir(config_file)?;
    let Some(state) = InstanceState::load(&state_dir) else {
        println!("No running instance found.");
        return Ok(());
    };

    if let Some(_lock) = InstanceLock::try_acquire(&state_dir)? {
        // Nobody orchestrates: the recorded pids may belong to anyone by now.
        warn!(pid = state.pid, "state.json left by an instance that is gone");
        InstanceState::remove(&state_dir)?;
        println!("No running instance found (cleared stale state).");
        return Ok(());
    }

    let holder = InstanceLock::holder(&state_dir);
    if holder != Some(state.pid) {
        // A new orchestrator took over and has not published its own state.
        let Some(pid) = holder.filter(|p| *p != std::process::id()) else {
            println!("No running instance found.");
            return Ok(());
        };
        println!("Stopping {} (pid {})...", state.slug, pid);
        shut_down_orchestrator(pid).await?;
        println!("Stopped.");
        return Ok(());
    }

    if state.pid != std::process::id() && platform::is_process_alive(state.pid) {
        println!("Stopping {} (pid {})...", state.slug, state.pid);
        shut_down_orchestrator(state.pid).await?;
    }

    for (name, svc) in &state.services {
        let Some(pid) = svc.pid else { continue };
        if platform::is_process_alive(pid) {
            debug!(service = %name, pid, "killing leftover service");
            if let Err(e) = platform::kill_tree(pid, KillMode::Force).await {
                warn!(service = %name, pid, error = %e, "could not kill leftover service");
            }
        }
    }

    InstanceState::remove(&state_dir)?;
    println!("Stopped.");
    Ok(())
}

async fn shut_down_orchestrator(pid: u32) -> Result<()> {
    platform::request_shutdown(pid).await?;

    let start = Instant::now();
    while platform::is_process_alive(pid) && start.elapsed() < STOP_TIMEOUT {
        tokio::time::sleep(POLL).await;
    }
    if platform::is_process_alive(pid) {
        warn!(pid, "orchestrator did not exit, killing it");
        platform::kill_tree(pid, KillMode::Force).await?;
    }
    Ok(())
}
