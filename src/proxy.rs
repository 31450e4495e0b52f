//! Forwarding dispatcher.
//!
//! Picks a destination from the resolved cluster, rewrites the request for
//! it, sends it, and hands the backend's response back with its body still
//! streaming. Nothing is buffered.
//!
//! # Headers
//!
//! Hop-by-hop headers are dropped in both directions, along with any header
//! the `Connection` header names. `Host` is replaced by the destination's
//! authority. Everything else, `Authorization` included, passes through as
//! is: backends receive the caller's token and can validate it themselves.
//!
//! With `forwarded_headers` enabled the dispatcher also sets
//! `X-Forwarded-For`, `X-Forwarded-Proto` and `X-Forwarded-Host`, replacing
//! whatever the caller sent under those names.
//!
//! # Cancellation
//!
//! When the client goes away hyper drops the connection task, which drops
//! the pending [`HttpClient`] future or the streaming body with it, so the
//! backend exchange stops promptly.

use std::net::SocketAddr;
use std::time::Duration;

use http::header::{HOST, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery};
use http::{HeaderMap, Request, Response, Uri, Version};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::warn;

use crate::cluster::{Cluster, InFlight};
use crate::error::Rejection;
use crate::response::Body;
use crate::token::Principal;

/// Outbound HTTP/1.1 client shared by the dispatcher and the health prober.
pub type HttpClient = Client<HttpConnector, Body>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn http_client() -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
    Client::builder(TokioExecutor::new()).build(connector)
}

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes connection-scoped headers, including those listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// `base` (scheme, authority, optional path prefix) joined with the path and
/// query of `original`.
pub fn target_uri(base: &Uri, original: &Uri) -> Result<Uri, http::Error> {
    let prefix = base.path().trim_end_matches('/');
    let rest = original.path_and_query().map_or("/", PathAndQuery::as_str);
    Uri::builder()
        .scheme(base.scheme_str().unwrap_or("http"))
        .authority(base.authority().map_or("", Authority::as_str))
        .path_and_query(format!("{prefix}{rest}"))
        .build()
}

/// Peer address of the inbound connection, stored in request extensions by
/// the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

pub struct Forwarder {
    client: HttpClient,
    /// Claim → header injected towards the backend.
    identity_headers: Vec<(String, HeaderName)>,
    forwarded_headers: bool,
}

impl Forwarder {
    pub fn new(client: HttpClient) -> Self {
        Self { client, identity_headers: Vec::new(), forwarded_headers: false }
    }

    pub fn with_identity_headers(mut self, headers: Vec<(String, HeaderName)>) -> Self {
        self.identity_headers = headers;
        self
    }

    pub fn with_forwarded_headers(mut self, enabled: bool) -> Self {
        self.forwarded_headers = enabled;
        self
    }

    /// Sends `req` to one of `cluster`'s healthy destinations.
    ///
    /// The cluster timeout bounds the wait for response headers. A refused
    /// connection, a timeout, or no healthy destination at all all become
    /// [`Rejection::UpstreamUnavailable`]. There is no retry.
    pub async fn forward(
        &self,
        cluster: &Cluster,
        req: Request<Body>,
        principal: &Principal,
    ) -> Result<Response<Body>, Rejection> {
        let destination = cluster.select().ok_or_else(|| {
            warn!(cluster = cluster.id(), "no healthy destination");
            Rejection::UpstreamUnavailable(format!("cluster {} has no healthy destination", cluster.id()))
        })?;

        let outbound = self
            .rewrite(destination.address(), req, principal)
            .map_err(|e| Rejection::UpstreamUnavailable(format!("building upstream uri: {e}")))?;

        let _in_flight = InFlight::enter(&destination);
        let response = match tokio::time::timeout(cluster.timeout(), self.client.request(outbound)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(cluster = cluster.id(), destination = destination.id(), "upstream request failed: {e}");
                return Err(Rejection::UpstreamUnavailable(e.to_string()));
            }
            Err(_) => {
                warn!(
                    cluster = cluster.id(),
                    destination = destination.id(),
                    timeout_ms = cluster.timeout().as_millis() as u64,
                    "upstream timed out"
                );
                return Err(Rejection::UpstreamUnavailable("timeout".to_owned()));
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed_unsync()))
    }

    /// Builds the outbound request for a destination at `base`.
    pub fn rewrite(
        &self,
        base: &Uri,
        req: Request<Body>,
        principal: &Principal,
    ) -> Result<Request<Body>, http::Error> {
        let (mut parts, body) = req.into_parts();
        if self.forwarded_headers {
            set_forwarded(&mut parts);
        }
        parts.uri = target_uri(base, &parts.uri)?;
        // The upstream client speaks HTTP/1.1 whatever the caller negotiated.
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(HOST);

        for (claim, header) in &self.identity_headers {
            parts.headers.remove(header);
            if let Some(value) = principal.claim_str(claim).and_then(|v| HeaderValue::from_str(v).ok()) {
                parts.headers.insert(header.clone(), value);
            }
        }
        Ok(Request::from_parts(parts, body))
    }
}

/// Must run before the URI and `Host` are rewritten for the destination.
fn set_forwarded(parts: &mut http::request::Parts) {
    let client = parts.extensions.get::<ClientAddr>().map(|addr| addr.0.ip().to_string());
    let proto = parts.uri.scheme_str().unwrap_or("http").to_owned();
    let host = parts
        .headers
        .get(HOST)
        .cloned()
        .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));

    let headers = &mut parts.headers;
    headers.remove(&X_FORWARDED_FOR);
    headers.remove(&X_FORWARDED_HOST);
    if let Some(client) = client.and_then(|c| HeaderValue::from_str(&c).ok()) {
        headers.insert(X_FORWARDED_FOR, client);
    }
    if let Ok(proto) = HeaderValue::from_str(&proto) {
        headers.insert(X_FORWARDED_PROTO, proto);
    }
    if let Some(host) = host {
        headers.insert(X_FORWARDED_HOST, host);
    }
}
