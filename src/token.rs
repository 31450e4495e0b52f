//! Bearer-token validation.
//!
//! A token is accepted when, in this order:
//!
//! 1. its header names an allowed algorithm and a `kid` we hold a key for,
//!    and the signature verifies against that key;
//! 2. `exp` has not passed and `nbf` is not in the future (within the
//!    configured clock skew);
//! 3. `iss` equals the trusted issuer.
//!
//! Audience is not checked. `exp`, `iss` and `sub` must be present.
//!
//! # Signing keys
//!
//! Keys come from the issuer's published JWK set and live in a [`KeyCache`].
//! Reads take a `parking_lot` read lock and clone an `Arc`; writes happen only
//! on refresh. An unknown `kid` triggers at most one refresh per
//! `key_refresh_interval`, so replaying garbage key ids cannot hammer the
//! issuer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("missing bearer token")]
    Missing,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("algorithm {0:?} is not allowed")]
    AlgorithmNotAllowed(Algorithm),

    #[error("algorithm does not match the signing key")]
    AlgorithmMismatch,

    #[error("no signing key for kid {0:?}")]
    UnknownKey(Option<String>),

    #[error("signature verification failed")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("issuer mismatch")]
    WrongIssuer,

    #[error("required claim {0:?} missing")]
    MissingClaim(String),

    #[error("signing keys unavailable: {0}")]
    KeyFetch(#[from] KeyFetchError),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match e.kind() {
            ErrorKind::ExpiredSignature        => Self::Expired,
            ErrorKind::ImmatureSignature       => Self::NotYetValid,
            ErrorKind::InvalidIssuer           => Self::WrongIssuer,
            ErrorKind::InvalidSignature        => Self::BadSignature,
            ErrorKind::InvalidAlgorithm        => Self::AlgorithmMismatch,
            ErrorKind::MissingRequiredClaim(c) => Self::MissingClaim(c.clone()),
            _                                  => Self::Malformed(e.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyFetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("GET {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("discovery document has no jwks_uri")]
    NoJwksUri,
}

// ── Principal ─────────────────────────────────────────────────────────────────

/// The validated identity behind a request.
#[derive(Debug, Clone)]
pub struct Principal {
    subject: String,
    claims: HashMap<String, Value>,
}

impl Principal {
    pub fn new(subject: impl Into<String>, claims: HashMap<String, Value>) -> Self {
        Self { subject: subject.into(), claims }
    }

    fn from_claims(claims: HashMap<String, Value>) -> Result<Self, TokenError> {
        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .ok_or_else(|| TokenError::MissingClaim("sub".to_owned()))?
            .to_owned();
        Ok(Self { subject, claims })
    }

    pub fn subject(&self) -> &str { &self.subject }

    /// String value of a claim; `None` when absent or not a string.
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }
}

// ── Key sources ───────────────────────────────────────────────────────────────

/// Where signing keys come from.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError>;
}

/// A fixed key set, for pinned keys and tests.
pub struct StaticKeys(JwkSet);

impl StaticKeys {
    pub fn new(keys: JwkSet) -> Self { Self(keys) }
}

#[async_trait]
impl KeySource for StaticKeys {
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError> {
        Ok(self.0.clone())
    }
}

/// Fetches the issuer's JWK set over HTTPS, discovering its location through
/// the OpenID configuration document unless `jwks_uri` is configured.
pub struct JwksKeySource {
    client: reqwest::Client,
    discovery_url: String,
    jwks_uri: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct Discovery {
    jwks_uri: Option<String>,
}

impl JwksKeySource {
    pub fn new(auth: &AuthConfig) -> Result<Self, KeyFetchError> {
        let client = reqwest::Client::builder()
            .timeout(auth.key_fetch_timeout())
            .https_only(auth.require_https_metadata)
            .build()
            .map_err(KeyFetchError::Client)?;

        Ok(Self {
            client,
            discovery_url: format!(
                "{}/.well-known/openid-configuration",
                auth.authority.trim_end_matches('/')
            ),
            jwks_uri: Mutex::new(auth.jwks_uri.clone()),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, KeyFetchError> {
        let http = |source| KeyFetchError::Http { url: url.to_owned(), source };
        self.client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(http)?
            .json()
            .await
            .map_err(http)
    }
}

#[async_trait]
impl KeySource for JwksKeySource {
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError> {
        let known = self.jwks_uri.lock().clone();
        let uri = match known {
            Some(uri) => uri,
            None => {
                let discovery: Discovery = self.get_json(&self.discovery_url).await?;
                let uri = discovery.jwks_uri.ok_or(KeyFetchError::NoJwksUri)?;
                info!(jwks_uri = %uri, "discovered signing key location");
                *self.jwks_uri.lock() = Some(uri.clone());
                uri
            }
        };
        self.get_json(&uri).await
    }
}

// ── Key cache ─────────────────────────────────────────────────────────────────

/// One usable verification key.
pub struct SigningKey {
    key: DecodingKey,
    /// Pinned by the JWK's `alg`, when it has one.
    algorithm: Option<Algorithm>,
}

#[derive(Default)]
struct KeySet {
    by_kid: HashMap<String, Arc<SigningKey>>,
    /// Set when the published set holds exactly one key; used for tokens
    /// that carry no `kid`.
    sole: Option<Arc<SigningKey>>,
}

impl KeySet {
    fn from_jwks(jwks: &JwkSet) -> Self {
        let mut usable = Vec::new();
        for jwk in &jwks.keys {
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                continue;
            }
            let algorithm = match &jwk.common.key_algorithm {
                Some(alg) => match signing_algorithm(alg) {
                    Some(alg) => Some(alg),
                    None => continue,
                },
                None => None,
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => usable.push((jwk.common.key_id.clone(), Arc::new(SigningKey { key, algorithm }))),
                Err(e) => warn!(kid = ?jwk.common.key_id, "skipping unusable signing key: {e}"),
            }
        }

        let sole = match usable.as_slice() {
            [(_, key)] => Some(Arc::clone(key)),
            _ => None,
        };
        let by_kid = usable
            .into_iter()
            .filter_map(|(kid, key)| Some((kid?, key)))
            .collect();
        Self { by_kid, sole }
    }

    fn len(&self) -> usize {
        self.by_kid.len().max(usize::from(self.sole.is_some()))
    }
}

/// The JWS algorithm a JWK's `alg` names. `None` for encryption algorithms.
fn signing_algorithm(alg: &KeyAlgorithm) -> Option<Algorithm> {
    Some(match alg {
        KeyAlgorithm::HS256 => Algorithm::HS256,
        KeyAlgorithm::HS384 => Algorithm::HS384,
        KeyAlgorithm::HS512 => Algorithm::HS512,
        KeyAlgorithm::ES256 => Algorithm::ES256,
        KeyAlgorithm::ES384 => Algorithm::ES384,
        KeyAlgorithm::RS256 => Algorithm::RS256,
        KeyAlgorithm::RS384 => Algorithm::RS384,
        KeyAlgorithm::RS512 => Algorithm::RS512,
        KeyAlgorithm::PS256 => Algorithm::PS256,
        KeyAlgorithm::PS384 => Algorithm::PS384,
        KeyAlgorithm::PS512 => Algorithm::PS512,
        KeyAlgorithm::EdDSA => Algorithm::EdDSA,
        _ => return None,
    })
}

/// Shared, read-mostly cache of the issuer's signing keys.
pub struct KeyCache {
    source: Arc<dyn KeySource>,
    keys: RwLock<Arc<KeySet>>,
    /// Last refresh attempt per unknown `kid`.
    misses: Mutex<HashMap<String, Instant>>,
    /// Serializes on-miss refreshes so concurrent misses fetch once.
    refreshing: tokio::sync::Mutex<()>,
    refresh_interval: Duration,
    fetch_timeout: Duration,
}

impl KeyCache {
    /// Builds the cache and performs the initial fetch. Failure here is
    /// meant to be fatal: the gateway must not start without keys.
    pub async fn bootstrap(
        source: Arc<dyn KeySource>,
        refresh_interval: Duration,
        fetch_timeout: Duration,
    ) -> Result<Self, KeyFetchError> {
        let cache = Self {
            source,
            keys: RwLock::new(Arc::new(KeySet::default())),
            misses: Mutex::new(HashMap::new()),
            refreshing: tokio::sync::Mutex::new(()),
            refresh_interval,
            fetch_timeout,
        };
        let count = cache.refresh().await?;
        info!(keys = count, "signing keys loaded");
        Ok(cache)
    }

    /// Replaces the key set with a fresh copy from the source.
    pub async fn refresh(&self) -> Result<usize, KeyFetchError> {
        let jwks = tokio::time::timeout(self.fetch_timeout, self.source.fetch())
            .await
            .map_err(|_| KeyFetchError::Timeout(self.fetch_timeout))??;
        let set = KeySet::from_jwks(&jwks);
        let count = set.len();
        *self.keys.write() = Arc::new(set);
        Ok(count)
    }

    /// Re-fetches the key set every `every`, keeping the old set on failure.
    /// Runs until the task is aborted.
    pub async fn refresh_periodically(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.refresh().await {
                Ok(count) => debug!(keys = count, "signing keys refreshed"),
                Err(e) => warn!("signing key refresh failed, keeping previous keys: {e}"),
            }
        }
    }

    fn lookup(&self, kid: Option<&str>) -> Option<Arc<SigningKey>> {
        let set = self.keys.read();
        match kid {
            Some(kid) => set.by_kid.get(kid).cloned(),
            None => set.sole.clone(),
        }
    }

    /// Returns the key for `kid`, refreshing once on a miss if the rate
    /// limit allows it.
    pub async fn key_for(&self, kid: Option<&str>) -> Result<Arc<SigningKey>, TokenError> {
        if let Some(key) = self.lookup(kid) {
            return Ok(key);
        }
        let Some(kid) = kid else {
            return Err(TokenError::UnknownKey(None));
        };
        let unknown = || TokenError::UnknownKey(Some(kid.to_owned()));

        let _refreshing = self.refreshing.lock().await;
        // Another task may have refreshed while we waited.
        if let Some(key) = self.lookup(Some(kid)) {
            return Ok(key);
        }
        {
            let now = Instant::now();
            let mut misses = self.misses.lock();
            if misses
                .get(kid)
                .is_some_and(|last| now.duration_since(*last) < self.refresh_interval)
            {
                return Err(unknown());
            }
            misses.retain(|_, last| now.duration_since(*last) < self.refresh_interval);
            misses.insert(kid.to_owned(), now);
        }

        debug!(kid, "unknown signing key, refreshing key set");
        if let Err(e) = self.refresh().await {
            warn!(kid, "signing key refresh failed: {e}");
            return Err(e.into());
        }
        self.lookup(Some(kid)).ok_or_else(unknown)
    }
}

// ── Validator ─────────────────────────────────────────────────────────────────

pub struct TokenValidator {
    keys: Arc<KeyCache>,
    issuer: String,
    algorithms: Vec<Algorithm>,
    leeway: u64,
}

impl TokenValidator {
    pub fn new(keys: Arc<KeyCache>, auth: &AuthConfig) -> Self {
        Self {
            keys,
            issuer: auth.issuer().to_owned(),
            algorithms: auth.algorithms.clone(),
            leeway: auth.clock_skew().as_secs(),
        }
    }

    pub async fn validate(&self, token: &str) -> Result<Principal, TokenError> {
        let header = decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;
        if !self.algorithms.contains(&header.alg) {
            return Err(TokenError::AlgorithmNotAllowed(header.alg));
        }

        let key = self.keys.key_for(header.kid.as_deref()).await?;
        if key.algorithm.is_some_and(|alg| alg != header.alg) {
            return Err(TokenError::AlgorithmMismatch);
        }

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = decode::<HashMap<String, Value>>(token, &key.key, &validation)?;
        Principal::from_claims(data.claims)
    }
}
