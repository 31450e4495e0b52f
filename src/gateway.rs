//! The admission pipeline and the runtime around it.
//!
//! Every inbound request walks the same fixed sequence:
//!
//! ```text
//! bearer token ─► validate ─► authorize ─► resolve route ─► forward
//!      401           401          403           404            502
//! ```
//!
//! The first failing stage decides the response and nothing after it runs.
//! A request that does not authenticate therefore never learns whether its
//! path would have matched, and never reaches a backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use http::header::{HeaderName, ORIGIN};
use http::Request;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::authz::AuthorizationGate;
use crate::cluster::Cluster;
use crate::config::{ConfigError, GatewayConfig};
use crate::error::{Error, Rejection};
use crate::health::HealthProber;
use crate::middleware::{CorsPolicy, RequestLog};
use crate::proxy::{Forwarder, HttpClient, http_client};
use crate::request::{bearer_token, host};
use crate::response::{Body, IntoResponse};
use crate::route::RouteTable;
use crate::token::{JwksKeySource, KeyCache, TokenError, TokenValidator};

pub struct Gateway {
    validator: TokenValidator,
    gate: AuthorizationGate,
    routes: RouteTable,
    forwarder: Forwarder,
    cors: Option<CorsPolicy>,
    clusters: Vec<Arc<Cluster>>,
}

impl Gateway {
    /// Assembles the pipeline from a validated configuration.
    pub fn from_config(
        config: &GatewayConfig,
        keys: Arc<KeyCache>,
        client: HttpClient,
    ) -> Result<Self, ConfigError> {
        let clusters = config
            .clusters
            .iter()
            .map(|(id, cluster)| Ok((id.clone(), Arc::new(Cluster::from_config(id, cluster)?))))
            .collect::<Result<BTreeMap<_, _>, ConfigError>>()?;
        let routes = RouteTable::from_config(&config.routes, &clusters)?;

        let identity_headers = config
            .identity_headers
            .iter()
            .map(|(claim, header)| {
                HeaderName::from_bytes(header.as_bytes())
                    .map(|name| (claim.clone(), name))
                    .map_err(|_| ConfigError::InvalidIdentityHeader(header.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cors = config.cors.as_ref().map(CorsPolicy::try_from).transpose()?;

        Ok(Self {
            validator: TokenValidator::new(keys, &config.auth),
            gate: AuthorizationGate::new(config.auth.authorized_party.as_str()),
            routes,
            forwarder: Forwarder::new(client)
                .with_identity_headers(identity_headers)
                .with_forwarded_headers(config.forwarded_headers),
            cors,
            clusters: clusters.into_values().collect(),
        })
    }

    pub fn cors(&self) -> Option<&CorsPolicy> {
        self.cors.as_ref()
    }

    /// Handles one request end to end. Never fails: every rejection becomes
    /// its response.
    pub async fn handle(&self, req: Request<Body>) -> Response {
        let log = RequestLog::start(&req);
        let origin = req.headers().get(ORIGIN).cloned();

        let preflight = self.cors.as_ref().and_then(|cors| cors.preflight(&req));
        let mut response = match preflight {
            Some(response) => response,
            None => match self.admit_and_forward(req).await {
                Ok(response) => response,
                Err(rejection) => {
                    debug!("request rejected: {rejection}");
                    rejection.into_response()
                }
            },
        };

        if let Some(cors) = &self.cors {
            cors.apply(origin.as_ref(), &mut response);
        }
        log.finish(response.status());
        response
    }

    async fn admit_and_forward(&self, req: Request<Body>) -> Result<Response, Rejection> {
        let token = bearer_token(req.headers()).ok_or(TokenError::Missing)?;
        let principal = self.validator.validate(token).await?;
        let authorized = self.gate.authorize(Some(principal))?;

        let route = self.routes.resolve(&authorized, host(&req), req.uri().path())?;
        debug!(route = route.id(), cluster = route.cluster().id(), "route resolved");

        self.forwarder
            .forward(route.cluster(), req, authorized.principal())
            .await
    }

    /// One prober per cluster that configures a health check.
    pub fn health_probes(&self, client: &HttpClient) -> Vec<HealthProber> {
        self.clusters
            .iter()
            .filter_map(|cluster| HealthProber::for_cluster(Arc::clone(cluster), client.clone()))
            .collect()
    }
}

type Response = http::Response<Body>;

/// The gateway plus its background tasks: periodic key refresh and one
/// health prober per probed cluster.
pub struct Runtime {
    gateway: Arc<Gateway>,
    tasks: JoinSet<()>,
}

impl Runtime {
    /// Fetches the signing keys, builds the pipeline and starts the
    /// background tasks. A key fetch failure here is fatal.
    pub async fn start(config: &GatewayConfig) -> Result<Self, Error> {
        let auth = &config.auth;
        let source = Arc::new(JwksKeySource::new(auth)?);
        let keys = Arc::new(
            KeyCache::bootstrap(source, auth.key_refresh_interval(), auth.key_fetch_timeout()).await?,
        );

        let client = http_client();
        let gateway = Gateway::from_config(config, Arc::clone(&keys), client.clone())?;

        if gateway.cors().is_some_and(CorsPolicy::is_permissive) {
            warn!("CORS allows any origin; restrict cors.allow_origins outside development");
        }

        let mut tasks = JoinSet::new();
        tasks.spawn(keys.refresh_periodically(auth.key_cache_ttl()));
        for prober in gateway.health_probes(&client) {
            tasks.spawn(prober.run());
        }
        info!(
            routes = gateway.routes.len(),
            clusters = gateway.clusters.len(),
            issuer = auth.issuer(),
            "gateway ready"
        );

        Ok(Self { gateway: Arc::new(gateway), tasks })
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        Arc::clone(&self.gateway)
    }

    /// Stops the background tasks.
    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
    }
}
