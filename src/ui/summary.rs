use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

use crate::error::StartupFailure;
use crate::identity::InstanceIdentity;
use crate::orchestrator::{PlanPreview, ReadyState, ServiceProgress, ServiceStatus};

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn print_indented(table: &Table) {
    for line in table.to_string().lines() {
        println!("  {}", line);
    }
}

fn status_text(svc: &ServiceProgress, use_color: bool) -> String {
    let label = if svc.external {
        "external"
    } else if svc.reused {
        "reused"
    } else {
        svc.status.as_str()
    };
    if !use_color {
        return format!("\u{25cf} {label}");
    }
    match svc.status {
        ServiceStatus::Healthy if svc.reused => format!("{} {}", "\u{25cf}".cyan(), label.cyan()),
        ServiceStatus::Healthy => format!("{} {}", "\u{25cf}".green(), label.green()),
        ServiceStatus::Started => format!("{} {}", "\u{25cf}".yellow(), label.yellow()),
        ServiceStatus::Failed => format!("{} {}", "\u{25cf}".red(), label.red()),
        ServiceStatus::NotStarted if svc.external => {
            format!("{} {}", "\u{25cf}".blue(), label.blue())
        }
        ServiceStatus::NotStarted => format!("\u{25cf} {}", label.dimmed()),
    }
}

pub fn print_ready_summary(identity: &InstanceIdentity, ready: &ReadyState) {
    let use_color = std::io::stdout().is_terminal();

    println!();
    if use_color {
        println!(
            "  {} {} ({})",
            "kioskboot".bold(),
            identity.name.cyan(),
            identity.id.dimmed()
        );
    } else {
        println!("  kioskboot {} ({})", identity.name, identity.id);
    }
    println!();

    let mut table = table();
    table.set_header(vec![
        Cell::new("Service").set_alignment(CellAlignment::Left),
        Cell::new("URL").set_alignment(CellAlignment::Left),
        Cell::new("PID").set_alignment(CellAlignment::Right),
        Cell::new("Status").set_alignment(CellAlignment::Center),
    ]);
    for svc in &ready.run.services {
        let url = svc
            .address
            .as_ref()
            .map(|a| a.url())
            .unwrap_or_else(|| "-".to_string());
        let pid = svc.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        table.add_row(vec![
            Cell::new(&svc.name),
            Cell::new(&url),
            Cell::new(&pid),
            Cell::new(status_text(svc, use_color)),
        ]);
    }
    print_indented(&table);

    if let Some(plan) = &ready.run.plan {
        if plan.used_fallback {
            println!();
            let note = format!(
                "Preferred ports {:?} were busy; using the fallback tier.",
                plan.occupied
            );
            if use_color {
                println!("  {}", note.yellow());
            } else {
                println!("  {note}");
            }
        }
    }

    println!();
    if use_color {
        println!("  Kiosk ready at {}", ready.ui_url().bold());
        println!("  Press {} to stop", "Ctrl+C".bold());
    } else {
        println!("  Kiosk ready at {}", ready.ui_url());
        println!("  Press Ctrl+C to stop");
    }
    println!();
}

pub fn print_plan(preview: &PlanPreview) {
    let use_color = std::io::stdout().is_terminal();

    println!();
    println!("  Launch order: {}", preview.order.join(" -> "));
    println!("  Port tier:    {}", preview.plan.tier());
    println!();

    let mut table = table();
    table.set_header(vec![
        Cell::new("Service").set_alignment(CellAlignment::Left),
        Cell::new("Preferred").set_alignment(CellAlignment::Right),
        Cell::new("Resolved").set_alignment(CellAlignment::Right),
    ]);
    for (i, name) in preview.plan.services.iter().enumerate() {
        let preferred = preview.plan.preferred.get(i).copied().unwrap_or_default();
        let resolved = preview.plan.resolved.get(i).copied().unwrap_or_default();
        let resolved = if resolved != preferred && use_color {
            resolved.to_string().yellow().to_string()
        } else {
            resolved.to_string()
        };
        table.add_row(vec![
            Cell::new(name),
            Cell::new(preferred),
            Cell::new(resolved),
        ]);
    }
    let ui_note = if preview.ui_already_serving {
        format!("{} (already serving)", preview.ui_port)
    } else {
        preview.ui_port.to_string()
    };
    table.add_row(vec![
        Cell::new(&preview.ui_service),
        Cell::new("-"),
        Cell::new(ui_note),
    ]);
    print_indented(&table);
    println!();
}

pub fn print_failure(failure: &StartupFailure) {
    let use_color = std::io::stderr().is_terminal();
    let headline = match failure.startup_error() {
        Some(e) if e.is_retryable() => "Startup failed (relaunching the app may help)",
        Some(_) => "Startup failed (operator action required)",
        None => "Startup failed",
    };

    eprintln!();
    if use_color {
        eprintln!("  {}", headline.red().bold());
    } else {
        eprintln!("  {headline}");
    }
    for line in format!("{:#}", failure.error).lines() {
        eprintln!("    {line}");
    }
    if let Some(path) = &failure.report_path {
        eprintln!();
        eprintln!("  Diagnostic report: {}", path.display());
    }
    eprintln!();
}
