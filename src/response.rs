//! Response bodies and the [`IntoResponse`] conversion trait.
//!
//! Every response the gateway produces has the same body type, [`Body`]:
//! either a small buffer the gateway wrote itself (rejections, preflights)
//! or the backend's body streamed through untouched.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue, WWW_AUTHENTICATE};
use http::{Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use serde::Serialize;

use crate::error::Rejection;

/// The one body type flowing through the gateway, in both directions.
pub type Body = UnsyncBoxBody<Bytes, hyper::Error>;

/// A buffered body.
pub fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

/// Conversion into a gateway response.
pub trait IntoResponse {
    fn into_response(self) -> Response<Body>;
}

impl IntoResponse for StatusCode {
    fn into_response(self) -> Response<Body> {
        let mut response = Response::new(empty());
        *response.status_mut() = self;
        response
    }
}

/// Status plus a generic JSON reason. `401`s also carry the bearer
/// challenge.
impl IntoResponse for Rejection {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        let body = serde_json::to_vec(&ErrorBody { error: self.reason() }).unwrap_or_default();

        let mut response = Response::new(full(body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if status == StatusCode::UNAUTHORIZED {
            headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenError;

    async fn text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn unauthorized_carries_challenge_and_generic_body() {
        let response = Rejection::TokenInvalid(TokenError::Expired).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[WWW_AUTHENTICATE], "Bearer");
        assert_eq!(text(response).await, r#"{"error":"unauthorized"}"#);
    }

    #[tokio::test]
    async fn forbidden_has_no_challenge() {
        let response = Rejection::AuthorizationDenied("azp mismatch").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(WWW_AUTHENTICATE).is_none());
        assert_eq!(text(response).await, r#"{"error":"forbidden"}"#);
    }

    #[tokio::test]
    async fn bare_status_has_empty_body() {
        let response = StatusCode::NO_CONTENT.into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(text(response).await.is_empty());
    }
}
