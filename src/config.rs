//! Gateway configuration.
//!
//! The gateway reads one JSON document at startup and never again. Everything
//! the admission pipeline needs (issuer, authorized party, ordered route
//! table, clusters, CORS policy) comes from this snapshot.
//!
//! ```json
//! {
//!   "listen": "0.0.0.0:8080",
//!   "auth": {
//!     "authority": "https://clerk.example.dev",
//!     "authorized_party": "https://app.example.com"
//!   },
//!   "routes": [
//!     { "id": "orders", "match": { "path": "/api/orders*" }, "cluster": "orders" },
//!     { "id": "api",    "match": { "path": "/api/*" },       "cluster": "catch-all" }
//!   ],
//!   "clusters": {
//!     "orders":    { "destinations": { "o1": { "address": "http://10.0.0.5:5000" } } },
//!     "catch-all": { "destinations": { "c1": { "address": "http://10.0.0.6:5000" } } }
//!   }
//! }
//! ```
//!
//! A configuration that fails [`GatewayConfig::validate`] is fatal: the
//! process must not accept traffic with it.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::Deserialize;

use crate::cluster::LoadBalancingPolicy;

/// Why a configuration was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("parsing configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("auth.authority must be an https URL, got {0:?}")]
    InsecureAuthority(String),

    #[error("auth.authorized_party must not be empty")]
    MissingAuthorizedParty,

    #[error("auth.algorithms must not be empty")]
    NoAlgorithms,

    #[error("duplicate route id {0:?}")]
    DuplicateRoute(String),

    #[error("route {0:?} matches neither a path nor a host")]
    EmptyMatch(String),

    #[error("route {route:?} references unknown cluster {cluster:?}")]
    UnknownCluster { route: String, cluster: String },

    #[error("route {route:?}: invalid path pattern {pattern:?}: {reason}")]
    InvalidPath { route: String, pattern: String, reason: String },

    #[error("cluster {0:?} has no destinations")]
    EmptyCluster(String),

    #[error("cluster {cluster:?}, destination {destination:?}: {reason}")]
    InvalidDestination { cluster: String, destination: String, reason: String },

    #[error("cluster {cluster:?}: invalid health check path {path:?}")]
    InvalidHealthCheck { cluster: String, path: String },

    #[error("cors: {0}")]
    InvalidCors(String),

    #[error("identity header {0:?} is not a valid header name")]
    InvalidIdentityHeader(String),

    #[error("{0} must be greater than zero")]
    ZeroDuration(String),
}

/// Root of the configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    pub auth: AuthConfig,

    /// Absent means no CORS headers are emitted at all.
    #[serde(default)]
    pub cors: Option<CorsConfig>,

    /// Claim name → header name injected towards backends. Empty by default:
    /// backends receive the original `Authorization` header and validate it
    /// themselves.
    #[serde(default)]
    pub identity_headers: BTreeMap<String, String>,

    /// Set `X-Forwarded-For`, `-Proto` and `-Host` towards backends.
    #[serde(default)]
    pub forwarded_headers: bool,

    /// Evaluated top to bottom, first match wins.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    pub clusters: BTreeMap<String, ClusterConfig>,

    /// How long in-flight connections may drain after a shutdown signal.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Base URL of the identity provider. OIDC discovery is performed
    /// against `{authority}/.well-known/openid-configuration`.
    pub authority: String,

    /// Expected `iss` claim. Defaults to the authority without trailing slash.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Skips discovery when set.
    #[serde(default)]
    pub jwks_uri: Option<String>,

    /// Required value of the `azp` claim, normally the frontend's origin.
    pub authorized_party: String,

    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<Algorithm>,

    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    #[serde(default = "default_key_fetch_timeout")]
    pub key_fetch_timeout_ms: u64,

    /// Minimum spacing between refreshes triggered by the same unknown `kid`.
    #[serde(default = "default_key_refresh_interval")]
    pub key_refresh_interval_secs: u64,

    /// Period of the background key-set refresh.
    #[serde(default = "default_key_cache_ttl")]
    pub key_cache_ttl_secs: u64,

    #[serde(default = "default_true")]
    pub require_https_metadata: bool,
}

impl AuthConfig {
    pub fn issuer(&self) -> &str {
        self.issuer
            .as_deref()
            .unwrap_or_else(|| self.authority.trim_end_matches('/'))
    }

    pub fn clock_skew(&self) -> Duration { Duration::from_secs(self.clock_skew_secs) }
    pub fn key_fetch_timeout(&self) -> Duration { Duration::from_millis(self.key_fetch_timeout_ms) }
    pub fn key_refresh_interval(&self) -> Duration { Duration::from_secs(self.key_refresh_interval_secs) }
    pub fn key_cache_ttl(&self) -> Duration { Duration::from_secs(self.key_cache_ttl_secs) }
}

/// CORS policy. Every list accepts `"*"` as a wildcard.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorsConfig {
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default)]
    pub allow_methods: Vec<String>,
    #[serde(default)]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub id: String,
    #[serde(rename = "match")]
    pub matcher: MatchConfig,
    pub cluster: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub destinations: BTreeMap<String, DestinationConfig>,
    #[serde(default)]
    pub load_balancing: LoadBalancingPolicy,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

impl GatewayConfig {
    /// Reads, parses and validates the file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parses and validates a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks. Pattern and address syntax is checked when the
    /// route table and clusters are built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let auth = &self.auth;
        if auth.require_https_metadata && !auth.authority.starts_with("https://") {
            return Err(ConfigError::InsecureAuthority(auth.authority.clone()));
        }
        if auth.authorized_party.trim().is_empty() {
            return Err(ConfigError::MissingAuthorizedParty);
        }
        if auth.algorithms.is_empty() {
            return Err(ConfigError::NoAlgorithms);
        }
        if auth.key_fetch_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("auth.key_fetch_timeout_ms".to_owned()));
        }
        if auth.key_cache_ttl_secs == 0 {
            return Err(ConfigError::ZeroDuration("auth.key_cache_ttl_secs".to_owned()));
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if !seen.insert(route.id.as_str()) {
                return Err(ConfigError::DuplicateRoute(route.id.clone()));
            }
            if route.matcher.path.is_none() && route.matcher.hosts.is_empty() {
                return Err(ConfigError::EmptyMatch(route.id.clone()));
            }
            if !self.clusters.contains_key(&route.cluster) {
                return Err(ConfigError::UnknownCluster {
                    route: route.id.clone(),
                    cluster: route.cluster.clone(),
                });
            }
        }

        for (id, cluster) in &self.clusters {
            if cluster.destinations.is_empty() {
                return Err(ConfigError::EmptyCluster(id.clone()));
            }
            if cluster.timeout_ms == 0 {
                return Err(ConfigError::ZeroDuration(format!("clusters.{id}.timeout_ms")));
            }
        }

        for header in self.identity_headers.values() {
            if http::HeaderName::from_bytes(header.as_bytes()).is_err() {
                return Err(ConfigError::InvalidIdentityHeader(header.clone()));
            }
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_listen() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 8080)) }
fn default_algorithms() -> Vec<Algorithm> { vec![Algorithm::RS256] }
fn default_clock_skew() -> u64 { 300 }
fn default_key_fetch_timeout() -> u64 { 5_000 }
fn default_key_refresh_interval() -> u64 { 300 }
fn default_key_cache_ttl() -> u64 { 3_600 }
fn default_true() -> bool { true }
fn default_upstream_timeout() -> u64 { 30_000 }
fn default_probe_interval() -> u64 { 10 }
fn default_probe_timeout() -> u64 { 5 }
fn default_shutdown_grace() -> u64 { 30 }
