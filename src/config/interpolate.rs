use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use crate::config::model::ServiceConfig;

/// Minimum Jaro-Winkler score to consider a template variable a close match.
const TEMPLATE_SUGGESTION_THRESHOLD: f64 = 0.8;

/// Compiled pattern matching `{{ path.to.value }}` template expressions.
static TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([\w.-]+)\s*\}\}").expect("template regex must compile"));

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unresolved variable '{{{{{{ {variable} }}}}}}' in {field}{}", suggestion.as_ref().map(|s| format!(" (did you mean `{}`?)", s)).unwrap_or_default())]
    UnresolvedVariable {
        field: String,
        variable: String,
        suggestion: Option<String>,
    },
}

/// A resolved, reachable address for one service.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
}

impl ServiceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Find the closest matching template variable name using Jaro-Winkler similarity.
fn find_closest_template_var<'a>(name: &str, vars: &'a HashMap<String, String>) -> Option<&'a str> {
    let mut best: Option<(&str, f64)> = None;
    for key in vars.keys() {
        let score = strsim::jaro_winkler(name, key);
        if score >= TEMPLATE_SUGGESTION_THRESHOLD && best.is_none_or(|(_, s)| score > s) {
            best = Some((key.as_str(), score));
        }
    }
    best.map(|(name, _)| name)
}

/// Resolve all `{{ var }}` expressions in `input` using `vars`.
///
/// Two-pass approach:
///   1. Validate that every referenced variable exists in `vars`.
///   2. Replace all references with their values.
pub fn resolve_template(
    input: &str,
    vars: &HashMap<String, String>,
    field_context: &str,
) -> Result<String, Vec<TemplateError>> {
    let errors: Vec<TemplateError> = TEMPLATE_RE
        .captures_iter(input)
        .filter_map(|cap| {
            let variable = cap[1].to_string();
            if vars.contains_key(&variable) {
                None
            } else {
                let suggestion = find_closest_template_var(&variable, vars).map(String::from);
                Some(TemplateError::UnresolvedVariable {
                    field: field_context.to_string(),
                    variable,
                    suggestion,
                })
            }
        })
        .collect();

    if !errors.is_empty() {
        return Err(errors);
    }

    let resolved = TEMPLATE_RE
        .replace_all(input, |cap: &regex::Captures| {
            let key = &cap[1];
            vars.get(key).cloned().unwrap_or_default()
        })
        .into_owned();

    Ok(resolved)
}

/// Names of other services referenced through `{{ services.<name>.* }}` in any
/// templated field of `svc`.
pub fn referenced_services(svc: &ServiceConfig) -> BTreeSet<String> {
    let mut fields: Vec<&str> = vec![svc.command.as_str(), svc.health.as_str()];
    fields.extend(svc.args.iter().map(String::as_str));
    fields.extend(svc.env.values().map(String::as_str));

    fields
        .into_iter()
        .flat_map(|f| TEMPLATE_RE.captures_iter(f))
        .filter_map(|cap| {
            let var = cap[1].to_string();
            let rest = var.strip_prefix("services.")?;
            let (name, _) = rest.rsplit_once('.')?;
            (name != svc.name).then(|| name.to_string())
        })
        .collect()
}

/// Build the lookup table for one service.
///
/// Produced keys:
///   - `project.name`
///   - `runtime`                         (resolved runtime executable, if any)
///   - `host`, `port`, `url`             (the service's own resolved address)
///   - `services.{name}.host|port|url`   (every already-resolved service)
pub fn build_template_vars(
    project_name: &str,
    runtime: Option<&str>,
    own: &ServiceAddress,
    resolved: &BTreeMap<String, ServiceAddress>,
) -> HashMap<String, String> {
    let mut vars = HashMap::new();

    vars.insert("project.name".to_string(), project_name.to_string());
    if let Some(runtime) = runtime {
        vars.insert("runtime".to_string(), runtime.to_string());
    }

    vars.insert("host".to_string(), own.host.clone());
    vars.insert("port".to_string(), own.port.to_string());
    vars.insert("url".to_string(), own.url());

    for (name, addr) in resolved {
        vars.insert(format!("services.{name}.host"), addr.host.clone());
        vars.insert(format!("services.{name}.port"), addr.port.to_string());
        vars.insert(format!("services.{name}.url"), addr.url());
    }

    vars
}

/// A service with every template expanded, ready to hand to the launcher.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedService {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub health_url: String,
}

/// Expand the health setting: a bare path is appended to the service URL, a
/// full URL is treated as a template.
fn health_template(health: &str) -> String {
    if health.starts_with("http://") || health.starts_with("https://") {
        health.to_string()
    } else if health.starts_with('/') {
        format!("{{{{ url }}}}{health}")
    } else {
        format!("{{{{ url }}}}/{health}")
    }
}

/// Render all templated fields of `svc`, layering `global_env` under the
/// service's own env overlay. Collects every unresolved variable instead of
/// stopping at the first.
pub fn render_service(
    svc: &ServiceConfig,
    global_env: &BTreeMap<String, String>,
    vars: &HashMap<String, String>,
) -> Result<RenderedService, Vec<TemplateError>> {
    let mut errors = Vec::new();
    let mut render = |input: &str, field: String| match resolve_template(input, vars, &field) {
        Ok(s) => s,
        Err(errs) => {
            errors.extend(errs);
            String::new()
        }
    };

    let program = render(&svc.command, format!("services.{}.command", svc.name));
    let args = svc
        .args
        .iter()
        .enumerate()
        .map(|(i, a)| render(a, format!("services.{}.args[{}]", svc.name, i)))
        .collect();

    let mut env = BTreeMap::new();
    for (k, v) in global_env {
        env.insert(k.clone(), render(v, format!("env.{k}")));
    }
    for (k, v) in &svc.env {
        env.insert(k.clone(), render(v, format!("services.{}.env.{}", svc.name, k)));
    }

    let health_url = render(
        &health_template(&svc.health),
        format!("services.{}.health", svc.name),
    );

    if errors.is_empty() {
        Ok(RenderedService {
            program,
            args,
            env,
            health_url,
        })
    } else {
        Err(errors)
    }
}

/// Join template errors into a single message.
pub fn format_template_errors(errors: &[TemplateError]) -> String {
    let mut msg = String::from("Template resolution errors:\n");
    for err in errors {
        msg.push_str(&format!("  - {}\n", err));
    }
    msg.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::ServiceKind;

    fn svc(name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            command: "./bin".to_string(),
            args: Vec::new(),
            port: Some(8081),
            health: "/health".to_string(),
            cwd: None,
            env: BTreeMap::new(),
            depends_on: Vec::new(),
            kind: ServiceKind::Backend,
        }
    }

    fn vars_for(own: u16, upstream: &[(&str, u16)]) -> HashMap<String, String> {
        let resolved = upstream
            .iter()
            .map(|(n, p)| (n.to_string(), ServiceAddress::new("127.0.0.1", *p)))
            .collect();
        build_template_vars(
            "kiosk",
            Some("/opt/jre/bin/java"),
            &ServiceAddress::new("127.0.0.1", own),
            &resolved,
        )
    }

    #[test]
    fn resolves_port_and_upstream_url() {
        let mut s = svc("payments");
        s.args = vec!["--port={{ port }}".to_string()];
        s.env.insert(
            "CORE_URL".to_string(),
            "{{services.core.url}}/api".to_string(),
        );
        let vars = vars_for(18081, &[("core", 18080)]);

        let rendered = render_service(&s, &BTreeMap::new(), &vars).unwrap();
        assert_eq!(rendered.args, vec!["--port=18081"]);
        assert_eq!(rendered.env["CORE_URL"], "http://127.0.0.1:18080/api");
        assert_eq!(rendered.health_url, "http://127.0.0.1:18081/health");
    }

    #[test]
    fn full_health_url_is_a_template() {
        let mut s = svc("core");
        s.health = "http://localhost:{{ port }}/actuator/health".to_string();
        let rendered = render_service(&s, &BTreeMap::new(), &vars_for(8080, &[])).unwrap();
        assert_eq!(rendered.health_url, "http://localhost:8080/actuator/health");

        s.health = "ready".to_string();
        let rendered = render_service(&s, &BTreeMap::new(), &vars_for(8080, &[])).unwrap();
        assert_eq!(rendered.health_url, "http://127.0.0.1:8080/ready");
    }

    #[test]
    fn runtime_variable_in_command() {
        let mut s = svc("core");
        s.command = "{{ runtime }}".to_string();
        let rendered = render_service(&s, &BTreeMap::new(), &vars_for(8080, &[])).unwrap();
        assert_eq!(rendered.program, "/opt/jre/bin/java");
    }

    #[test]
    fn global_env_is_overlaid_by_service_env() {
        let mut s = svc("core");
        s.env.insert("MODE".to_string(), "service".to_string());
        let global = BTreeMap::from([
            ("MODE".to_string(), "global".to_string()),
            ("APP".to_string(), "{{ project.name }}".to_string()),
        ]);
        let rendered = render_service(&s, &global, &vars_for(8080, &[])).unwrap();
        assert_eq!(rendered.env["MODE"], "service");
        assert_eq!(rendered.env["APP"], "kiosk");
    }

    #[test]
    fn unresolved_upstream_reports_every_error_with_suggestion() {
        let mut s = svc("payments");
        s.env.insert("A".to_string(), "{{ services.core.url }}".to_string());
        s.args = vec!["{{ prot }}".to_string()];
        let errors = render_service(&s, &BTreeMap::new(), &vars_for(8081, &[])).unwrap_err();
        assert_eq!(errors.len(), 2);
        let joined = format_template_errors(&errors);
        assert!(joined.contains("services.core.url"), "{joined}");
        assert!(joined.contains("did you mean `port`"), "{joined}");
    }

    #[test]
    fn referenced_services_excludes_self() {
        let mut s = svc("payments");
        s.env.insert("A".to_string(), "{{ services.core.url }}".to_string());
        s.args = vec!["--self={{ services.payments.port }}".to_string()];
        s.health = "{{ services.auth-api.url }}/health".to_string();
        let refs: Vec<_> = referenced_services(&s).into_iter().collect();
        assert_eq!(refs, vec!["auth-api".to_string(), "core".to_string()]);
    }
}
