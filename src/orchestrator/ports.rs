use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::StartupError;
use crate::orchestrator::health::HealthGate;

/// Outcome of planning the backend ports. Resolved ports come either all
/// from the preferred tier or all from the fallback tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPlan {
    pub services: Vec<String>,
    pub preferred: Vec<u16>,
    pub resolved: Vec<u16>,
    pub used_fallback: bool,
    /// Ports found occupied by something other than the expected service.
    pub occupied: Vec<u16>,
    /// Resolved ports where the expected service already answers health.
    #[serde(default)]
    pub serving: Vec<u16>,
}

impl PortPlan {
    /// A plan that keeps every preferred port without probing anything.
    pub fn preferred_only(services: Vec<String>, preferred: Vec<u16>) -> Self {
        Self {
            services,
            resolved: preferred.clone(),
            preferred,
            used_fallback: false,
            occupied: Vec::new(),
            serving: Vec::new(),
        }
    }

    pub fn resolved_for(&self, service: &str) -> Option<u16> {
        self.services
            .iter()
            .position(|s| s == service)
            .and_then(|i| self.resolved.get(i).copied())
    }

    pub fn tier(&self) -> &'static str {
        if self.used_fallback {
            "fallback"
        } else {
            "preferred"
        }
    }
}

/// Shift every preferred port by `base - preferred[0]`, keeping the spacing
/// between services. The shifted set must stay in range and must not overlap
/// the preferred set or itself.
pub fn fallback_ports(preferred: &[u16], base: u16) -> Result<Vec<u16>, StartupError> {
    let Some(&first) = preferred.first() else {
        return Ok(Vec::new());
    };
    let offset = i32::from(base) - i32::from(first);

    let mut shifted = Vec::with_capacity(preferred.len());
    for &port in preferred {
        let candidate = i32::from(port) + offset;
        let port = u16::try_from(candidate)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                StartupError::InvalidFallback(format!(
                    "port {port} shifted by {offset} lands outside 1..=65535"
                ))
            })?;
        shifted.push(port);
    }

    let preferred_set: BTreeSet<u16> = preferred.iter().copied().collect();
    let mut seen = BTreeSet::new();
    for &port in &shifted {
        if preferred_set.contains(&port) {
            return Err(StartupError::InvalidFallback(format!(
                "fallback port {port} collides with a preferred port"
            )));
        }
        if !seen.insert(port) {
            return Err(StartupError::InvalidFallback(format!(
                "fallback port {port} is assigned twice"
            )));
        }
    }
    Ok(shifted)
}

/// True when something accepts a TCP connection on `host:port`. A bound
/// listener counts even if it is not serving HTTP yet.
pub async fn is_port_occupied(host: &str, port: u16, probe: Duration) -> bool {
    matches!(
        tokio::time::timeout(probe, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// How the UI server port was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UiPortChoice {
    pub port: u16,
    /// The preferred port already answers the UI health URL.
    pub already_serving: bool,
}

/// One backend asking for a port, probed on its own host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortClaim {
    pub service: String,
    pub host: String,
    pub preferred: u16,
}

/// Result of probing one tier.
#[derive(Debug, Default)]
struct TierProbe {
    /// Held by something that does not answer the service's health URL.
    foreign: Vec<u16>,
    /// Held by a healthy instance of the service itself.
    serving: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct PortResolver {
    probe_timeout: Duration,
    gate: HealthGate,
    reachable_timeout: Duration,
}

impl PortResolver {
    pub fn new(probe_timeout: Duration, gate: HealthGate, reachable_timeout: Duration) -> Self {
        Self {
            probe_timeout,
            gate,
            reachable_timeout,
        }
    }

    /// Probe `ports[i]` for `claims[i]`. An occupied port that answers the
    /// claiming service's health URL is that service, not a conflict.
    async fn probe_tier<F>(&self, claims: &[PortClaim], ports: &[u16], health_url: &F) -> TierProbe
    where
        F: Fn(&str, u16) -> String,
    {
        let mut probe = TierProbe::default();
        for (claim, &port) in claims.iter().zip(ports) {
            if !is_port_occupied(&claim.host, port, self.probe_timeout).await {
                continue;
            }
            let url = health_url(&claim.service, port);
            if !url.is_empty() && self.gate.is_reachable(&url, self.reachable_timeout).await {
                debug!(service = %claim.service, port, "port held by a healthy instance");
                probe.serving.push(port);
            } else {
                debug!(service = %claim.service, port, "port occupied");
                probe.foreign.push(port);
            }
        }
        probe
    }

    /// Compute the backend port plan: the preferred ports unless a foreign
    /// process holds one of them, otherwise the whole fallback tier. Foreign
    /// processes in both tiers is fatal.
    pub async fn plan<F>(
        &self,
        claims: &[PortClaim],
        health_url: F,
        fallback_base: Option<u16>,
    ) -> Result<PortPlan, StartupError>
    where
        F: Fn(&str, u16) -> String,
    {
        let services: Vec<String> = claims.iter().map(|c| c.service.clone()).collect();
        let preferred: Vec<u16> = claims.iter().map(|c| c.preferred).collect();

        let first = self.probe_tier(claims, &preferred, &health_url).await;
        if first.foreign.is_empty() {
            info!(ports = ?preferred, serving = ?first.serving, "preferred tier available");
            return Ok(PortPlan {
                services,
                resolved: preferred.clone(),
                preferred,
                used_fallback: false,
                occupied: Vec::new(),
                serving: first.serving,
            });
        }

        let Some(base) = fallback_base else {
            return Err(StartupError::PortsExhausted {
                preferred: first.foreign,
                fallback: Vec::new(),
            });
        };
        let fallback = fallback_ports(&preferred, base)?;
        let second = self.probe_tier(claims, &fallback, &health_url).await;
        if !second.foreign.is_empty() {
            return Err(StartupError::PortsExhausted {
                preferred: first.foreign,
                fallback: second.foreign,
            });
        }

        warn!(
            occupied = ?first.foreign,
            fallback = ?fallback,
            "preferred ports occupied, using fallback tier"
        );
        Ok(PortPlan {
            services,
            preferred,
            resolved: fallback,
            used_fallback: true,
            occupied: first.foreign,
            serving: second.serving,
        })
    }

    /// Pick the UI server port on `host`. A healthy server on the preferred
    /// port is reused. Otherwise scan `window` ports upward from the
    /// preferred one, skipping occupied and `reserved` ports. A fully occupied
    /// window yields the preferred port so the spawn fails loudly.
    pub async fn resolve_ui_port(
        &self,
        host: &str,
        preferred: u16,
        health_url: impl Fn(u16) -> String,
        window: u16,
        reserved: &[u16],
    ) -> UiPortChoice {
        if self
            .gate
            .is_reachable(&health_url(preferred), self.reachable_timeout)
            .await
        {
            info!(port = preferred, "UI server already serving");
            return UiPortChoice {
                port: preferred,
                already_serving: true,
            };
        }

        for step in 0..window.max(1) {
            let Some(candidate) = preferred.checked_add(step) else {
                break;
            };
            if reserved.contains(&candidate) {
                continue;
            }
            if !is_port_occupied(host, candidate, self.probe_timeout).await {
                if candidate != preferred {
                    info!(preferred, port = candidate, "UI port moved");
                }
                return UiPortChoice {
                    port: candidate,
                    already_serving: false,
                };
            }
        }

        warn!(preferred, window, "no free UI port in scan window");
        UiPortChoice {
            port: preferred,
            already_serving: false,
        }
    }
}
