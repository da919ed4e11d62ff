use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config::resolve::resolve_config;
use crate::orchestrator::state::InstanceState;
use crate::platform::is_process_alive;

/// State directory of the install whose config `config_file` (or discovery)
/// points at.
pub fn state_dir(config_file: Option<&Path>) -> Result<PathBuf> {
    let config_path = resolve_config(config_file)?;
    let config_path = config_path.canonicalize().unwrap_or(config_path);
    let project_dir = config_path.parent().unwrap_or(Path::new("."));
    Ok(InstanceState::state_dir_for(project_dir))
}

pub fn run(config_file: Option<&Path>, json: bool) -> Result<()> {
    let state_dir = state_dir(config_file)?;

    let state = match InstanceState::load(&state_dir) {
        Some(s) => s,
        None => {
            println!("No running instance found.");
            println!("Run `kioskboot start` to start the kiosk.");
            return Ok(());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    let alive = is_process_alive(state.pid);
    println!(
        "  Instance: {} (pid {}, {}, started {})",
        state.slug,
        state.pid,
        if alive { "running" } else { "gone" },
        state.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!("  Phase:    {}", state.phase);
    if let Some(url) = &state.ui_url {
        println!("  UI:       {url}");
    }
    if let Some(report) = &state.report_path {
        println!("  Report:   {report}");
    }
    if let Some(plan) = &state.plan {
        println!("  Ports:    {} tier", plan.tier());
    }
    println!();
    println!("  {:<16} {:<8} {:<28} STATUS", "SERVICE", "PID", "URL");
    println!("  {}", "-".repeat(64));

    for (name, svc) in &state.services {
        let url = format!("http://{}:{}", svc.host, svc.port);
        let (pid, status) = match svc.pid {
            Some(pid) if is_process_alive(pid) => (pid.to_string(), "running"),
            Some(pid) => (pid.to_string(), "stopped"),
            None => ("-".to_string(), "reused"),
        };
        let ui_tag = if svc.ui { " (ui)" } else { "" };
        println!(
            "  {:<16} {:<8} {:<28} {}",
            format!("{name}{ui_tag}"),
            pid,
            url,
            status
        );
    }
    println!();
    Ok(())
}
