//! Ordered route table.
//!
//! Rules are checked top to bottom and the first one that matches wins.
//! Ordering is an operator decision, so there is no longest-prefix
//! reordering: put specific rules above general ones.
//!
//! Path patterns come in three shapes:
//!
//! | Pattern | Matches |
//! |---|---|
//! | `/api/orders*` | any path starting with `/api/orders` |
//! | `/billing/{**rest}` | `/billing` and anything below `/billing/` |
//! | `/billing/invoice/{id}` | exactly that shape, via a [`matchit`] radix tree |
//!
//! Host patterns are exact (`api.example.com`) or a leading wildcard
//! (`*.example.com`, sub-domains only). Ports and case are ignored.

use std::collections::BTreeMap;
use std::sync::Arc;

use matchit::Router as MatchitRouter;

use crate::authz::Authorized;
use crate::cluster::Cluster;
use crate::config::{ConfigError, RouteConfig};
use crate::error::Rejection;

// ── Path patterns ─────────────────────────────────────────────────────────────

enum PathKind {
    Prefix(String),
    /// Segment-bounded prefix: `base` itself or anything under `base/`.
    CatchAll(String),
    Template(MatchitRouter<()>),
}

pub struct PathPattern {
    kind: PathKind,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if !raw.starts_with('/') {
            return Err("must start with '/'".to_owned());
        }

        let kind = if let Some(start) = raw.rfind("/{**").filter(|_| raw.ends_with('}')) {
            PathKind::CatchAll(raw[..start].to_owned())
        } else if let Some(prefix) = raw.strip_suffix('*') {
            if prefix.contains('*') {
                return Err("'*' is only allowed at the end".to_owned());
            }
            PathKind::Prefix(prefix.to_owned())
        } else {
            let mut tree = MatchitRouter::new();
            tree.insert(raw, ()).map_err(|e| e.to_string())?;
            PathKind::Template(tree)
        };
        Ok(Self { kind })
    }

    pub fn matches(&self, path: &str) -> bool {
        match &self.kind {
            PathKind::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathKind::CatchAll(base) => {
                path == base
                    || path
                        .strip_prefix(base.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            PathKind::Template(tree) => tree.at(path).is_ok(),
        }
    }
}

// ── Host patterns ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPattern {
    Exact(String),
    /// Stored with its leading dot: `*.example.com` → `.example.com`.
    Suffix(String),
}

impl HostPattern {
    pub fn parse(raw: &str) -> Self {
        let raw = strip_port(raw.trim()).to_ascii_lowercase();
        match raw.strip_prefix('*') {
            Some(suffix) if suffix.starts_with('.') => Self::Suffix(suffix.to_owned()),
            _ => Self::Exact(raw),
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = strip_port(host).to_ascii_lowercase();
        match self {
            Self::Exact(want) => host == *want,
            Self::Suffix(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
        }
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal, keep the brackets.
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    host.split_once(':').map_or(host, |(name, _)| name)
}

// ── Rules ─────────────────────────────────────────────────────────────────────

pub struct RouteRule {
    id: String,
    path: Option<PathPattern>,
    hosts: Vec<HostPattern>,
    cluster: Arc<Cluster>,
}

impl RouteRule {
    pub fn new(
        id: impl Into<String>,
        path: Option<PathPattern>,
        hosts: Vec<HostPattern>,
        cluster: Arc<Cluster>,
    ) -> Self {
        Self { id: id.into(), path, hosts, cluster }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn cluster(&self) -> &Arc<Cluster> { &self.cluster }

    /// Every configured predicate must hold; a rule with hosts matches when
    /// any one of them does.
    pub fn matches(&self, host: Option<&str>, path: &str) -> bool {
        let host_ok = self.hosts.is_empty()
            || host.is_some_and(|h| self.hosts.iter().any(|p| p.matches(h)));
        let path_ok = self.path.as_ref().is_none_or(|p| p.matches(path));
        host_ok && path_ok
    }
}

/// The ordered, immutable route table.
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    /// Builds the table in configuration order. `clusters` must contain
    /// every cluster the routes reference.
    pub fn from_config(
        routes: &[RouteConfig],
        clusters: &BTreeMap<String, Arc<Cluster>>,
    ) -> Result<Self, ConfigError> {
        let mut rules = Vec::with_capacity(routes.len());
        for route in routes {
            let cluster = clusters.get(&route.cluster).ok_or_else(|| ConfigError::UnknownCluster {
                route: route.id.clone(),
                cluster: route.cluster.clone(),
            })?;
            let path = route
                .matcher
                .path
                .as_deref()
                .map(|raw| {
                    PathPattern::parse(raw).map_err(|reason| ConfigError::InvalidPath {
                        route: route.id.clone(),
                        pattern: raw.to_owned(),
                        reason,
                    })
                })
                .transpose()?;
            let hosts = route.matcher.hosts.iter().map(|h| HostPattern::parse(h)).collect();
            rules.push(RouteRule::new(route.id.as_str(), path, hosts, Arc::clone(cluster)));
        }
        Ok(Self::new(rules))
    }

    pub fn len(&self) -> usize { self.rules.len() }

    /// First rule matching `host` and `path`. Requires an [`Authorized`]
    /// request: route existence is never revealed before authentication.
    pub fn resolve(
        &self,
        _authorized: &Authorized,
        host: Option<&str>,
        path: &str,
    ) -> Result<&RouteRule, Rejection> {
        self.rules
            .iter()
            .find(|rule| rule.matches(host, path))
            .ok_or(Rejection::NoRouteMatched)
    }
}
