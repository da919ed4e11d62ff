use anyhow::Result;
use std::path::Path;

use crate::config::resolve::resolve_config;
use crate::orchestrator::{Orchestrator, Workspace};
use crate::ui::summary;

/// Print launch order and port assignments without starting anything.
pub async fn run(config_file: Option<&Path>, json: bool) -> Result<()> {
    let config_path = resolve_config(config_file)?;
    let orchestrator = Orchestrator::new(Workspace::load(&config_path)?);
    let preview = orchestrator.preview().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&preview)?);
    } else {
        summary::print_plan(&preview);
    }
    Ok(())
}
