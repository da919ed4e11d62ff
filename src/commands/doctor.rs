use anyhow::{bail, Result};
use std::path::Path;

use crate::config::resolve::resolve_config;
use crate::diagnostics::StaticChecks;
use crate::orchestrator::ports::is_port_occupied;
use crate::orchestrator::preconditions;
use crate::orchestrator::Workspace;

/// Run the checks a failed startup would report on, without starting
/// anything.
pub async fn run(config_file: Option<&Path>) -> Result<()> {
    let config_path = resolve_config(config_file)?;
    let ws = Workspace::load(&config_path)?;

    println!("kioskboot doctor");
    println!("================");
    println!();

    let checks = StaticChecks::gather(&ws);
    println!("  mode           {}", checks.mode);
    println!("  config         {}", checks.config_path.display());
    if let Some(env) = &checks.env_file {
        println!("  env file       {}", env.display());
    }
    println!("  kill strategy  {}", checks.kill_strategy);
    println!();

    let mut problems = 0usize;
    for path in &checks.paths {
        // State and logs dirs are created on first start.
        let optional = path.label == "state dir" || path.label == "logs dir";
        if path.exists {
            println!("  [ok] {:<20} {}", path.label, path.path.display());
        } else if optional {
            println!("  [--] {:<20} {} (not created yet)", path.label, path.path.display());
        } else {
            println!("  [!!] {:<20} {} missing", path.label, path.path.display());
            problems += 1;
        }
    }

    match preconditions::check_all(&ws.config, &ws.identity.config_dir, &ws.pool, &ws.overrides)
        .await
    {
        Ok(report) => {
            if let Some(rt) = &report.runtime {
                let version = rt
                    .major
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "unchecked".into());
                println!("  [ok] {:<20} {} ({})", "runtime", rt.path, version);
            }
            if let Some(tier) = &report.tier {
                println!(
                    "  [ok] {:<20} tier {} ({} required)",
                    "credentials",
                    tier,
                    report.credentials_checked.len()
                );
            }
        }
        Err(e) => {
            println!("  [!!] {:<20} {}", "preconditions", e);
            problems += 1;
        }
    }

    for svc in &ws.config.services {
        let Ok(port) = ws.preferred_port(svc) else {
            continue;
        };
        let host = ws.host_for(&svc.name);
        if !is_port_occupied(host, port, ws.config.timeouts.tcp_probe).await {
            println!("  [ok] {:<20} port {} free", svc.name, port);
        } else {
            println!("  [--] {:<20} port {} in use", svc.name, port);
        }
    }

    println!();
    if problems > 0 {
        bail!("{problems} problem(s) found");
    }
    println!("No problems found.");
    Ok(())
}
