use anyhow::{bail, Result};
use owo_colors::OwoColorize;
use std::path::Path;

use crate::config;
use crate::config::resolve::{resolve_config, CONFIG_FILENAME};
use crate::config::validate::validate;
use crate::orchestrator::graph::DependencyResolver;
use crate::orchestrator::ports::fallback_ports;

/// Check the config statically and show what a start would launch.
pub fn run(config_file: Option<&Path>) -> Result<()> {
    let config_path = resolve_config(config_file)?;
    let (config, source) = config::load_config(&config_path)?;
    let filename = config_path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| CONFIG_FILENAME.to_string());

    if let Err(errors) = validate(&config, &source, &filename) {
        let count = errors.len();
        for err in errors {
            eprintln!("{:?}", miette::Report::new(err));
        }
        bail!("{filename} has {count} problem(s)");
    }

    let ui = config.ui_service().map(|s| s.name.as_str()).unwrap_or("-");
    println!(
        "  {} {} is valid ({} backend(s), UI server '{}')",
        "\u{2713}".green(),
        filename,
        config.backends().count(),
        ui,
    );

    let order = DependencyResolver::from_config(&config).and_then(|r| r.start_order());
    if let Ok(order) = order {
        println!("  {} {}", "launch order:".dimmed(), order.join(" -> "));
    }

    let preferred: Vec<u16> = config.backends().filter_map(|s| s.port).collect();
    if let Some(base) = config.ports.fallback_base {
        if let Ok(fallback) = fallback_ports(&preferred, base) {
            println!(
                "  {} {:?} -> {:?}",
                "fallback tier:".dimmed(),
                preferred,
                fallback
            );
        }
    }
    Ok(())
}
