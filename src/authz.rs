//! Authorization gate.
//!
//! The single place where policy sits between a validated token and the
//! route table. Two checks today: a principal must exist, and its `azp`
//! claim must equal the configured authorized party. There is no anonymous
//! fallback.

use crate::error::Rejection;
use crate::token::{Principal, TokenError};

/// Proof that a request passed the gate.
///
/// Only [`AuthorizationGate::authorize`] constructs it, and the route
/// resolver demands one, so nothing reaches routing unauthenticated.
#[derive(Debug)]
pub struct Authorized {
    principal: Principal,
}

impl Authorized {
    pub fn principal(&self) -> &Principal { &self.principal }
}

pub struct AuthorizationGate {
    authorized_party: String,
}

impl AuthorizationGate {
    pub fn new(authorized_party: impl Into<String>) -> Self {
        Self { authorized_party: authorized_party.into() }
    }

    pub fn authorize(&self, principal: Option<Principal>) -> Result<Authorized, Rejection> {
        let principal = principal.ok_or(Rejection::TokenInvalid(TokenError::Missing))?;
        match principal.claim_str("azp") {
            Some(azp) if azp == self.authorized_party => Ok(Authorized { principal }),
            Some(_) => Err(Rejection::AuthorizationDenied("azp mismatch")),
            None => Err(Rejection::AuthorizationDenied("azp missing")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use http::StatusCode;
    use serde_json::{Value, json};

    use super::*;

    fn principal(azp: Option<Value>) -> Principal {
        let mut claims = HashMap::from([("sub".to_owned(), json!("user_1"))]);
        if let Some(azp) = azp {
            claims.insert("azp".to_owned(), azp);
        }
        Principal::new("user_1", claims)
    }

    fn gate() -> AuthorizationGate {
        AuthorizationGate::new("https://app.example.com")
    }

    #[test]
    fn matching_azp_passes_principal_through() {
        let authorized = gate().authorize(Some(principal(Some(json!("https://app.example.com"))))).unwrap();
        assert_eq!(authorized.principal().subject(), "user_1");
    }

    #[test]
    fn mismatched_azp_is_forbidden() {
        for azp in ["https://evil.example.com", "https://app.example.com/", "HTTPS://APP.EXAMPLE.COM", ""] {
            let err = gate().authorize(Some(principal(Some(json!(azp))))).unwrap_err();
            assert_eq!(err.status(), StatusCode::FORBIDDEN, "azp {azp:?}");
        }
    }

    #[test]
    fn missing_or_non_string_azp_is_forbidden() {
        assert_eq!(gate().authorize(Some(principal(None))).unwrap_err().status(), StatusCode::FORBIDDEN);
        assert_eq!(gate().authorize(Some(principal(Some(json!(42))))).unwrap_err().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn absent_principal_is_unauthorized() {
        let err = gate().authorize(None).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }
}
