use std::collections::BTreeMap;

use anyhow::{Context, Result};

use super::env::EnvPool;
use super::model::KioskConfig;

pub const EXTERNAL_BACKENDS_VAR: &str = "KIOSK_EXTERNAL_BACKENDS";
pub const SKIP_RUNTIME_CHECK_VAR: &str = "KIOSK_SKIP_RUNTIME_CHECK";
pub const FALLBACK_BASE_VAR: &str = "KIOSK_FALLBACK_PORT_BASE";
pub const DISABLE_CORS_WORKAROUND_VAR: &str = "KIOSK_DISABLE_CORS_WORKAROUND";
pub const ENV_TIER_VAR: &str = "KIOSK_ENV_TIER";

/// Per-service address override from `KIOSK_<SERVICE>_HOST` / `_PORT`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressOverride {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Every environment-driven knob, resolved once up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overrides {
    pub addresses: BTreeMap<String, AddressOverride>,
    pub external_backends: bool,
    pub skip_runtime_check: bool,
    pub fallback_base: Option<u16>,
    pub cors_workaround: bool,
    pub env_tier: Option<String>,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            addresses: BTreeMap::new(),
            external_backends: false,
            skip_runtime_check: false,
            fallback_base: None,
            cors_workaround: true,
            env_tier: None,
        }
    }
}

/// `payment-api` -> `PAYMENT_API`
pub fn env_key(service: &str) -> String {
    service
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn parse_port(pool: &EnvPool, key: &str) -> Result<Option<u16>> {
    match pool.get(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .map(Some)
            .with_context(|| format!("{key}={raw:?} is not a valid port")),
    }
}

impl Overrides {
    pub fn from_env(config: &KioskConfig, pool: &EnvPool) -> Result<Self> {
        let mut addresses = BTreeMap::new();
        for svc in &config.services {
            let upper = env_key(&svc.name);
            let host = pool
                .get(&format!("KIOSK_{upper}_HOST"))
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from);
            let port = parse_port(pool, &format!("KIOSK_{upper}_PORT"))?;
            if host.is_some() || port.is_some() {
                addresses.insert(svc.name.clone(), AddressOverride { host, port });
            }
        }

        Ok(Self {
            addresses,
            external_backends: pool.flag(EXTERNAL_BACKENDS_VAR),
            skip_runtime_check: pool.flag(SKIP_RUNTIME_CHECK_VAR),
            fallback_base: parse_port(pool, FALLBACK_BASE_VAR)?,
            cors_workaround: !pool.flag(DISABLE_CORS_WORKAROUND_VAR),
            env_tier: pool
                .get(ENV_TIER_VAR)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from),
        })
    }

    /// Preferred port for a service after applying any override.
    pub fn port_for(&self, service: &str, configured: Option<u16>) -> Option<u16> {
        self.addresses
            .get(service)
            .and_then(|a| a.port)
            .or(configured)
    }

    pub fn host_for<'a>(&'a self, service: &str, default: &'a str) -> &'a str {
        self.addresses
            .get(service)
            .and_then(|a| a.host.as_deref())
            .unwrap_or(default)
    }

    pub fn fallback_base(&self, configured: Option<u16>) -> Option<u16> {
        self.fallback_base.or(configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KioskConfig {
        toml::from_str(
            r#"
            [project]
            name = "k"
            [[services]]
            name = "core-api"
            command = "core"
            port = 8080
            [[services]]
            name = "ui"
            kind = "ui"
            command = "node"
            port = 3000
            "#,
        )
        .unwrap()
    }

    fn pool(vars: &[(&str, &str)]) -> EnvPool {
        EnvPool::from_layers(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn env_key_normalizes_names() {
        assert_eq!(env_key("core-api"), "CORE_API");
        assert_eq!(env_key("ui"), "UI");
    }

    #[test]
    fn defaults_when_nothing_set() {
        let o = Overrides::from_env(&config(), &pool(&[])).unwrap();
        assert_eq!(o, Overrides::default());
        assert_eq!(o.port_for("core-api", Some(8080)), Some(8080));
        assert_eq!(o.host_for("core-api", "127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn address_and_flag_overrides() {
        let o = Overrides::from_env(
            &config(),
            &pool(&[
                ("KIOSK_CORE_API_PORT", "9090"),
                ("KIOSK_CORE_API_HOST", "10.0.0.5"),
                ("KIOSK_EXTERNAL_BACKENDS", "1"),
                ("KIOSK_SKIP_RUNTIME_CHECK", "true"),
                ("KIOSK_FALLBACK_PORT_BASE", "28080"),
                ("KIOSK_DISABLE_CORS_WORKAROUND", "yes"),
                ("KIOSK_ENV_TIER", "production"),
            ]),
        )
        .unwrap();
        assert_eq!(o.port_for("core-api", Some(8080)), Some(9090));
        assert_eq!(o.host_for("core-api", "127.0.0.1"), "10.0.0.5");
        assert_eq!(o.port_for("ui", Some(3000)), Some(3000));
        assert!(o.external_backends);
        assert!(o.skip_runtime_check);
        assert_eq!(o.fallback_base(Some(18080)), Some(28080));
        assert!(!o.cors_workaround);
        assert_eq!(o.env_tier.as_deref(), Some("production"));
    }

    #[test]
    fn invalid_port_override_errors() {
        let err = Overrides::from_env(&config(), &pool(&[("KIOSK_UI_PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("KIOSK_UI_PORT"));
    }
}
