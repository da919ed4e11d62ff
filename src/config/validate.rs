// The miette/thiserror derive macros generate code that triggers false
// positive unused_assignments warnings on enum variant fields.
#![allow(unused_assignments)]

use std::collections::BTreeMap;

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::config::interpolate::referenced_services;
use crate::config::model::KioskConfig;
use crate::orchestrator::graph::DependencyResolver;
use crate::orchestrator::ports::fallback_ports;

// ---------------------------------------------------------------------------
// ConfigDiagnostic: miette-powered validation error
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigDiagnostic {
    #[error("unknown dependency `{dependency}`")]
    #[diagnostic(code(kioskboot::missing_dependency))]
    MissingDependency {
        #[source_code]
        src: NamedSource<String>,
        #[label("service `{service}` depends on `{dependency}`, which does not exist")]
        span: SourceSpan,
        #[help]
        advice: String,
        service: String,
        dependency: String,
    },

    #[error("service name `{name}` is declared more than once")]
    #[diagnostic(code(kioskboot::duplicate_service))]
    DuplicateService {
        #[source_code]
        src: NamedSource<String>,
        #[label("duplicate name")]
        span: SourceSpan,
        name: String,
    },

    #[error("port {port} is used by multiple services: {services:?}")]
    #[diagnostic(code(kioskboot::duplicate_port))]
    DuplicatePort {
        #[source_code]
        src: NamedSource<String>,
        #[label("duplicate port")]
        span: SourceSpan,
        port: u16,
        services: Vec<String>,
    },

    #[error("dependency cycle detected involving `{node}`")]
    #[diagnostic(code(kioskboot::dependency_cycle))]
    DependencyCycle {
        #[source_code]
        src: NamedSource<String>,
        #[label("cycle involves this service")]
        span: SourceSpan,
        node: String,
    },

    #[error("service `{service}` has an empty command")]
    #[diagnostic(code(kioskboot::empty_command))]
    EmptyCommand {
        #[source_code]
        src: NamedSource<String>,
        #[label("command is empty")]
        span: SourceSpan,
        service: String,
    },

    #[error("service `{service}` has no port")]
    #[diagnostic(
        code(kioskboot::missing_port),
        help("every service is health-checked over HTTP and needs a preferred port")
    )]
    MissingPort {
        #[source_code]
        src: NamedSource<String>,
        #[label("declared here")]
        span: SourceSpan,
        service: String,
    },

    #[error("expected exactly one service with kind = \"ui\", found {count}")]
    #[diagnostic(code(kioskboot::ui_count))]
    UiCount {
        #[source_code]
        src: NamedSource<String>,
        #[label("services are declared here")]
        span: SourceSpan,
        count: usize,
    },

    #[error("backend `{service}` depends on the UI server `{ui}`")]
    #[diagnostic(
        code(kioskboot::backend_depends_on_ui),
        help("the UI server always starts after every backend")
    )]
    BackendDependsOnUi {
        #[source_code]
        src: NamedSource<String>,
        #[label("dependency on the UI server")]
        span: SourceSpan,
        service: String,
        ui: String,
    },

    #[error("invalid fallback port plan: {reason}")]
    #[diagnostic(code(kioskboot::invalid_fallback))]
    InvalidFallback {
        #[source_code]
        src: NamedSource<String>,
        #[label("fallback base")]
        span: SourceSpan,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Source span helpers
// ---------------------------------------------------------------------------

/// Byte offset of the `name = "<service>"` value inside a `[[services]]` block.
fn find_service_span(source: &str, service: &str) -> SourceSpan {
    let quoted = format!("\"{}\"", service);
    let mut search_from = 0;
    while let Some(rel) = source[search_from..].find("[[services]]") {
        let block_start = search_from + rel;
        let block_end = source[block_start + 1..]
            .find("[[services]]")
            .map(|p| block_start + 1 + p)
            .unwrap_or(source.len());
        let block = &source[block_start..block_end];
        for line in block.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("name") && trimmed.contains(&quoted) {
                let line_pos = block.find(line).unwrap_or(0);
                let col = line.find(&quoted).unwrap_or(0) + 1;
                return (block_start + line_pos + col, service.len()).into();
            }
        }
        search_from = block_end;
        if search_from >= source.len() {
            break;
        }
    }
    if let Some(pos) = source.find(&quoted) {
        return (pos + 1, service.len()).into();
    }
    (0, 0).into()
}

/// Byte offset of `field = ...` within the block of `service`, falling back to
/// the service name.
fn find_service_field_span(source: &str, service: &str, field: &str) -> SourceSpan {
    let anchor = find_service_span(source, service);
    let start = anchor.offset();
    let block_end = source[start..]
        .find("[[services]]")
        .map(|p| start + p)
        .unwrap_or(source.len());
    let block = &source[start..block_end];
    for prefix in [format!("{} =", field), format!("{}=", field)] {
        if let Some(rel) = block.find(&prefix) {
            let abs = start + rel;
            let line_len = source[abs..].find('\n').unwrap_or(source.len() - abs);
            return (abs, line_len).into();
        }
    }
    anchor
}

/// Byte offset of a quoted dependency inside the block of `service`.
fn find_dependency_span(source: &str, service: &str, dep: &str) -> SourceSpan {
    let anchor = find_service_span(source, service);
    let start = anchor.offset();
    let block_end = source[start..]
        .find("[[services]]")
        .map(|p| start + p)
        .unwrap_or(source.len());
    let quoted = format!("\"{}\"", dep);
    if let Some(rel) = source[start..block_end].find(&quoted) {
        return (start + rel + 1, dep.len()).into();
    }
    if let Some(rel) = source[start..block_end].find(dep) {
        return (start + rel, dep.len()).into();
    }
    anchor
}

fn find_key_span(source: &str, key: &str) -> SourceSpan {
    match source.find(key) {
        Some(pos) => (pos, key.len()).into(),
        None => (0, 0).into(),
    }
}

// ---------------------------------------------------------------------------
// Similarity suggestions
// ---------------------------------------------------------------------------

fn find_closest_match<'a>(name: &str, candidates: &'a [String]) -> Option<&'a str> {
    let mut best: Option<(&str, f64)> = None;
    for candidate in candidates {
        let score = strsim::jaro_winkler(name, candidate);
        if score >= 0.8 && best.is_none_or(|(_, s)| score > s) {
            best = Some((candidate.as_str(), score));
        }
    }
    best.map(|(name, _)| name)
}

// ---------------------------------------------------------------------------
// Main validation function
// ---------------------------------------------------------------------------

pub fn validate(
    config: &KioskConfig,
    source: &str,
    filename: &str,
) -> Result<(), Vec<ConfigDiagnostic>> {
    let mut errors = Vec::new();
    let src = NamedSource::new(filename, source.to_string());

    let available: Vec<String> = config.services.iter().map(|s| s.name.clone()).collect();

    // Unique names
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for svc in &config.services {
        *seen.entry(svc.name.as_str()).or_default() += 1;
    }
    for (name, count) in &seen {
        if *count > 1 {
            errors.push(ConfigDiagnostic::DuplicateService {
                src: src.clone(),
                span: find_service_span(source, name),
                name: name.to_string(),
            });
        }
    }

    // Exactly one UI server
    let ui_names: Vec<&str> = config
        .services
        .iter()
        .filter(|s| s.is_ui())
        .map(|s| s.name.as_str())
        .collect();
    if ui_names.len() != 1 {
        errors.push(ConfigDiagnostic::UiCount {
            src: src.clone(),
            span: find_key_span(source, "[[services]]"),
            count: ui_names.len(),
        });
    }

    for svc in &config.services {
        if svc.command.trim().is_empty() {
            errors.push(ConfigDiagnostic::EmptyCommand {
                src: src.clone(),
                span: find_service_field_span(source, &svc.name, "command"),
                service: svc.name.clone(),
            });
        }
        if svc.port.is_none() {
            errors.push(ConfigDiagnostic::MissingPort {
                src: src.clone(),
                span: find_service_span(source, &svc.name),
                service: svc.name.clone(),
            });
        }

        let mut deps: Vec<String> = svc.depends_on.clone();
        deps.extend(referenced_services(svc));
        deps.sort();
        deps.dedup();
        for dep in &deps {
            if !available.contains(dep) {
                let advice = match find_closest_match(dep, &available) {
                    Some(s) => format!("did you mean `{}`?", s),
                    None => format!("available services: {:?}", available),
                };
                errors.push(ConfigDiagnostic::MissingDependency {
                    src: src.clone(),
                    span: find_dependency_span(source, &svc.name, dep),
                    advice,
                    service: svc.name.clone(),
                    dependency: dep.clone(),
                });
            } else if !svc.is_ui() && ui_names.contains(&dep.as_str()) {
                errors.push(ConfigDiagnostic::BackendDependsOnUi {
                    src: src.clone(),
                    span: find_dependency_span(source, &svc.name, dep),
                    service: svc.name.clone(),
                    ui: dep.clone(),
                });
            }
        }
    }

    // No two services share a preferred port
    let mut port_map: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for svc in &config.services {
        if let Some(p) = svc.port {
            port_map.entry(p).or_default().push(svc.name.clone());
        }
    }
    for (port, services) in port_map {
        if services.len() > 1 {
            errors.push(ConfigDiagnostic::DuplicatePort {
                src: src.clone(),
                span: find_service_field_span(source, &services[1], "port"),
                port,
                services,
            });
        }
    }

    // Cycles (only meaningful once every dependency exists)
    let deps_ok = !errors
        .iter()
        .any(|e| matches!(e, ConfigDiagnostic::MissingDependency { .. } | ConfigDiagnostic::DuplicateService { .. }));
    if deps_ok {
        if let Err(node) = DependencyResolver::from_config(config).and_then(|r| r.cycle_check()) {
            errors.push(ConfigDiagnostic::DependencyCycle {
                src: src.clone(),
                span: find_service_span(source, &node),
                node,
            });
        }
    }

    // Fallback tier arithmetic
    if let Some(base) = config.ports.fallback_base {
        let preferred: Vec<u16> = config.backends().filter_map(|s| s.port).collect();
        if let Err(e) = fallback_ports(&preferred, base) {
            errors.push(ConfigDiagnostic::InvalidFallback {
                src: src.clone(),
                span: find_key_span(source, "fallback_base"),
                reason: e.to_string(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
