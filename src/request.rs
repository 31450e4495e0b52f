//! Inbound request inspection.

use http::header::{AUTHORIZATION, HOST};
use http::{HeaderMap, Request};

/// Token from an `Authorization: Bearer <token>` header. The scheme is
/// case-insensitive; anything else yields `None`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Host the client addressed: the URI authority (HTTP/2, absolute-form) or
/// the `Host` header (HTTP/1.1). May include a port.
pub fn host<B>(req: &Request<B>) -> Option<&str> {
    req.uri()
        .host()
        .or_else(|| req.headers().get(HOST)?.to_str().ok())
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn headers(authorization: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(AUTHORIZATION, HeaderValue::from_str(authorization).unwrap());
        map
    }

    #[test]
    fn bearer_token_extraction() {
        assert_eq!(bearer_token(&headers("Bearer abc.def.ghi")), Some("abc.def.ghi"));
        assert_eq!(bearer_token(&headers("bearer  abc")), Some("abc"));
        assert_eq!(bearer_token(&headers("Basic dXNlcjpwYXNz")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&headers("Bearer")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn host_prefers_uri_authority() {
        let req = Request::get("http://api.example.com/x")
            .header(HOST, "other.example.com")
            .body(())
            .unwrap();
        assert_eq!(host(&req), Some("api.example.com"));

        let req = Request::get("/x").header(HOST, "api.example.com:8080").body(()).unwrap();
        assert_eq!(host(&req), Some("api.example.com:8080"));

        let req = Request::get("/x").body(()).unwrap();
        assert_eq!(host(&req), None);
    }
}
