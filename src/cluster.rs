//! Clusters, destinations and load balancing.
//!
//! Cluster membership is fixed at startup. The only mutable state is
//! per-destination health (written by the prober) and the counters the
//! balancing policies use, all plain atomics so the request path never takes
//! a lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use http::Uri;
use serde::Deserialize;

use crate::config::{ClusterConfig, ConfigError};

/// How a cluster picks among its healthy destinations.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingPolicy {
    /// Rotate through healthy destinations in configuration order.
    #[default]
    RoundRobin,
    /// Always the first healthy destination; the rest are standbys.
    FirstAvailable,
    /// The healthy destination with the fewest requests awaiting a response.
    LeastRequests,
}

/// One backend endpoint.
#[derive(Debug)]
pub struct Destination {
    id: String,
    address: Uri,
    healthy: AtomicBool,
    in_flight: AtomicUsize,
}

impl Destination {
    pub fn new(id: impl Into<String>, address: Uri) -> Self {
        Self {
            id: id.into(),
            address,
            healthy: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn address(&self) -> &Uri { &self.address }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Records a health observation; returns the previous state.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Counts a request against a destination until dropped.
pub(crate) struct InFlight(Arc<Destination>);

impl InFlight {
    pub(crate) fn enter(destination: &Arc<Destination>) -> Self {
        destination.in_flight.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(destination))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Active health probe settings for a cluster.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub path: Uri,
    pub interval: Duration,
    pub timeout: Duration,
}

/// A named group of destinations behind one balancing policy.
#[derive(Debug)]
pub struct Cluster {
    id: String,
    destinations: Vec<Arc<Destination>>,
    policy: LoadBalancingPolicy,
    cursor: AtomicUsize,
    timeout: Duration,
    health_check: Option<HealthCheck>,
}

impl Cluster {
    /// Fails when `destinations` is empty: every cluster has at least one.
    pub fn new(
        id: impl Into<String>,
        destinations: Vec<Destination>,
        policy: LoadBalancingPolicy,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let id = id.into();
        if destinations.is_empty() {
            return Err(ConfigError::EmptyCluster(id));
        }
        Ok(Self {
            id,
            destinations: destinations.into_iter().map(Arc::new).collect(),
            policy,
            cursor: AtomicUsize::new(0),
            timeout,
            health_check: None,
        })
    }

    pub fn from_config(id: &str, config: &ClusterConfig) -> Result<Self, ConfigError> {
        let invalid = |destination: &str, reason: String| ConfigError::InvalidDestination {
            cluster: id.to_owned(),
            destination: destination.to_owned(),
            reason,
        };

        let mut destinations = Vec::with_capacity(config.destinations.len());
        for (name, dest) in &config.destinations {
            let address: Uri = dest
                .address
                .parse()
                .map_err(|e| invalid(name, format!("invalid address {:?}: {e}", dest.address)))?;
            if address.scheme_str() != Some("http") || address.authority().is_none() {
                return Err(invalid(name, format!("address {:?} must be an absolute http:// URL", dest.address)));
            }
            if address.query().is_some() {
                return Err(invalid(name, "address must not carry a query string".to_owned()));
            }
            destinations.push(Destination::new(name.as_str(), address));
        }

        let mut cluster = Self::new(
            id,
            destinations,
            config.load_balancing,
            Duration::from_millis(config.timeout_ms),
        )?;

        if let Some(probe) = &config.health_check {
            let path: Uri = probe
                .path
                .parse()
                .ok()
                .filter(|p: &Uri| p.scheme().is_none() && p.path().starts_with('/'))
                .ok_or_else(|| ConfigError::InvalidHealthCheck {
                    cluster: id.to_owned(),
                    path: probe.path.clone(),
                })?;
            cluster.health_check = Some(HealthCheck {
                path,
                interval: Duration::from_secs(probe.interval_secs.max(1)),
                timeout: Duration::from_secs(probe.timeout_secs.max(1)),
            });
        }
        Ok(cluster)
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn destinations(&self) -> &[Arc<Destination>] { &self.destinations }
    pub fn policy(&self) -> LoadBalancingPolicy { self.policy }
    pub fn timeout(&self) -> Duration { self.timeout }
    pub fn health_check(&self) -> Option<&HealthCheck> { self.health_check.as_ref() }

    /// Picks a healthy destination, or `None` when every one is down.
    pub fn select(&self) -> Option<Arc<Destination>> {
        let healthy: Vec<&Arc<Destination>> =
            self.destinations.iter().filter(|d| d.is_healthy()).collect();
        if healthy.is_empty() {
            return None;
        }

        let chosen = match self.policy {
            LoadBalancingPolicy::RoundRobin => {
                let n = self.cursor.fetch_add(1, Ordering::Relaxed);
                healthy[n % healthy.len()]
            }
            LoadBalancingPolicy::FirstAvailable => healthy[0],
            LoadBalancingPolicy::LeastRequests => {
                healthy.iter().copied().min_by_key(|d| d.in_flight())?
            }
        };
        Some(Arc::clone(chosen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(policy: LoadBalancingPolicy) -> Cluster {
        Cluster::new(
            "billing",
            vec![
                Destination::new("a", Uri::from_static("http://10.0.0.1:5000")),
                Destination::new("b", Uri::from_static("http://10.0.0.2:5000")),
            ],
            policy,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    fn picks(cluster: &Cluster, n: usize) -> Vec<String> {
        (0..n).map(|_| cluster.select().unwrap().id().to_owned()).collect()
    }

    #[test]
    fn round_robin_alternates_between_healthy_destinations() {
        let c = cluster(LoadBalancingPolicy::RoundRobin);
        assert_eq!(picks(&c, 4), ["a", "b", "a", "b"]);
    }

    #[test]
    fn unhealthy_destination_receives_nothing() {
        let c = cluster(LoadBalancingPolicy::RoundRobin);
        c.destinations()[0].set_healthy(false);
        assert_eq!(picks(&c, 3), ["b", "b", "b"]);
    }

    #[test]
    fn no_healthy_destination_selects_none() {
        let c = cluster(LoadBalancingPolicy::RoundRobin);
        for d in c.destinations() {
            d.set_healthy(false);
        }
        assert!(c.select().is_none());
    }

    #[test]
    fn first_available_fails_over() {
        let c = cluster(LoadBalancingPolicy::FirstAvailable);
        assert_eq!(picks(&c, 2), ["a", "a"]);
        c.destinations()[0].set_healthy(false);
        assert_eq!(picks(&c, 2), ["b", "b"]);
    }

    #[test]
    fn least_requests_prefers_idle_destination() {
        let c = cluster(LoadBalancingPolicy::LeastRequests);
        let busy = InFlight::enter(&c.destinations()[0]);
        assert_eq!(c.select().unwrap().id(), "b");
        drop(busy);
        assert_eq!(c.destinations()[0].in_flight(), 0);
    }

    #[test]
    fn set_healthy_reports_previous_state() {
        let d = Destination::new("a", Uri::from_static("http://10.0.0.1"));
        assert!(d.set_healthy(false));
        assert!(!d.set_healthy(true));
        assert!(d.is_healthy());
    }

    #[test]
    fn empty_cluster_is_an_error() {
        let err = Cluster::new("none", Vec::new(), LoadBalancingPolicy::RoundRobin, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCluster(id) if id == "none"));
    }

    fn config(address: &str) -> ClusterConfig {
        serde_json::from_value(serde_json::json!({
            "destinations": { "d1": { "address": address } },
            "health_check": { "path": "/healthz", "interval_secs": 2 }
        }))
        .unwrap()
    }

    #[test]
    fn from_config_parses_destinations_and_probe() {
        let c = Cluster::from_config("orders", &config("http://127.0.0.1:7000/base")).unwrap();
        assert_eq!(c.destinations()[0].address().path(), "/base");
        assert_eq!(c.policy(), LoadBalancingPolicy::RoundRobin);
        let probe = c.health_check().unwrap();
        assert_eq!(probe.path.path(), "/healthz");
        assert_eq!(probe.interval, Duration::from_secs(2));
    }

    #[test]
    fn non_http_destination_is_rejected() {
        for address in ["https://10.0.0.1", "10.0.0.1:80", "/relative"] {
            assert!(
                matches!(Cluster::from_config("c", &config(address)), Err(ConfigError::InvalidDestination { .. })),
                "{address} should be rejected"
            );
        }
    }
}
