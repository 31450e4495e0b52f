//! Error types.
//!
//! Two families live here. [`Error`] covers infrastructure failures that stop
//! the process from starting or serving: binding a port, loading the
//! configuration, fetching the issuer's signing keys at boot. [`Rejection`]
//! covers per-request failures of the admission pipeline; each one maps to
//! exactly one HTTP status and never takes the process down.

use http::StatusCode;

use crate::config::ConfigError;
use crate::token::{KeyFetchError, TokenError};

/// The error type returned by gatehouse's fallible startup operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("signing keys: {0}")]
    Keys(#[from] KeyFetchError),
}

/// Why the pipeline refused to forward a request.
///
/// The `Display` text carries the internal reason and is meant for logs only.
/// Clients see [`Rejection::reason`], which never includes claim values or
/// key material.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    /// Missing, malformed, expired or badly signed token; also any failure
    /// to obtain signing keys (fail closed).
    #[error("token invalid: {0}")]
    TokenInvalid(#[from] TokenError),

    /// The token is genuine but was not issued to the expected party.
    #[error("authorization denied: {0}")]
    AuthorizationDenied(&'static str),

    #[error("no route matched")]
    NoRouteMatched,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TokenInvalid(_)        => StatusCode::UNAUTHORIZED,
            Self::AuthorizationDenied(_) => StatusCode::FORBIDDEN,
            Self::NoRouteMatched         => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Generic, client-safe reason phrase.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TokenInvalid(_)        => "unauthorized",
            Self::AuthorizationDenied(_) => "forbidden",
            Self::NoRouteMatched         => "not found",
            Self::UpstreamUnavailable(_) => "bad gateway",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_rejection_maps_to_its_status() {
        assert_eq!(Rejection::TokenInvalid(TokenError::Missing).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Rejection::AuthorizationDenied("azp missing").status(), StatusCode::FORBIDDEN);
        assert_eq!(Rejection::NoRouteMatched.status(), StatusCode::NOT_FOUND);
        assert_eq!(Rejection::UpstreamUnavailable("refused".into()).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn key_fetch_failure_fails_closed() {
        let rejection = Rejection::from(TokenError::KeyFetch(KeyFetchError::NoJwksUri));
        assert_eq!(rejection.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(rejection.reason(), "unauthorized");
    }

    #[test]
    fn public_reason_hides_internal_detail() {
        let rejection = Rejection::AuthorizationDenied("azp mismatch");
        assert!(rejection.to_string().contains("azp mismatch"));
        assert!(!rejection.reason().contains("azp"));
    }
}
