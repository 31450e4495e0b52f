//! CORS.
//!
//! Preflights (`OPTIONS` with `Origin` and `Access-Control-Request-Method`)
//! from an allowed origin are answered here, before authentication: browsers
//! never attach credentials to a preflight. Preflights from other origins
//! fall through to the pipeline and get its `401` like any other request.
//!
//! On actual responses, rejections included, the allow-origin and expose
//! headers are added when the origin is allowed.
//!
//! The fully permissive policy (`"*"` everywhere) is a development setting.
//! The gateway logs a warning at startup when it is in effect.

use std::str::FromStr;

use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, HeaderName, HeaderValue, ORIGIN,
    VARY,
};
use http::{Method, Request, Response, StatusCode};

use crate::config::{ConfigError, CorsConfig};
use crate::response::{Body, IntoResponse};

#[derive(Debug, Clone, Default)]
enum WildcardOrList<T> {
    #[default]
    None,
    Wildcard,
    List(Vec<T>),
}

impl<T: FromStr> WildcardOrList<T> {
    fn parse(values: &[String], what: &str) -> Result<Self, ConfigError> {
        if values.iter().any(|v| v == "*") {
            return Ok(Self::Wildcard);
        }
        if values.is_empty() {
            return Ok(Self::None);
        }
        values
            .iter()
            .map(|v| T::from_str(v.trim()).map_err(|_| ConfigError::InvalidCors(format!("invalid {what} {v:?}"))))
            .collect::<Result<Vec<_>, _>>()
            .map(Self::List)
    }
}

impl<T: AsRef<str>> WildcardOrList<T> {
    /// Comma-joined list, `*`, or nothing.
    fn header_value(&self) -> Option<HeaderValue> {
        match self {
            Self::None => None,
            Self::Wildcard => Some(HeaderValue::from_static("*")),
            Self::List(items) => {
                let joined = items.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",");
                HeaderValue::from_str(&joined).ok()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allow_origins: WildcardOrList<String>,
    allow_methods: WildcardOrList<Method>,
    allow_headers: WildcardOrList<HeaderName>,
    expose_headers: WildcardOrList<HeaderName>,
    allow_credentials: bool,
    max_age: Option<HeaderValue>,
}

impl TryFrom<&CorsConfig> for CorsPolicy {
    type Error = ConfigError;

    fn try_from(config: &CorsConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            allow_origins: WildcardOrList::parse(&config.allow_origins, "origin")?,
            allow_methods: WildcardOrList::parse(&config.allow_methods, "method")?,
            allow_headers: WildcardOrList::parse(&config.allow_headers, "header")?,
            expose_headers: WildcardOrList::parse(&config.expose_headers, "header")?,
            allow_credentials: config.allow_credentials,
            max_age: config.max_age_secs.map(HeaderValue::from),
        })
    }
}

impl CorsPolicy {
    /// Any origin, any method, any header.
    pub fn permissive() -> Self {
        Self {
            allow_origins: WildcardOrList::Wildcard,
            allow_methods: WildcardOrList::Wildcard,
            allow_headers: WildcardOrList::Wildcard,
            expose_headers: WildcardOrList::None,
            allow_credentials: false,
            max_age: None,
        }
    }

    pub fn is_permissive(&self) -> bool {
        matches!(self.allow_origins, WildcardOrList::Wildcard)
    }

    /// The value to send back as `Access-Control-Allow-Origin`, if `origin`
    /// is allowed.
    fn allow_origin(&self, origin: &HeaderValue) -> Option<HeaderValue> {
        match &self.allow_origins {
            WildcardOrList::None => None,
            // `*` is not valid alongside credentials; echo the origin instead.
            WildcardOrList::Wildcard if self.allow_credentials => Some(origin.clone()),
            WildcardOrList::Wildcard => Some(HeaderValue::from_static("*")),
            WildcardOrList::List(origins) => {
                let origin_str = origin.to_str().ok()?;
                origins
                    .iter()
                    .any(|want| want.eq_ignore_ascii_case(origin_str))
                    .then(|| origin.clone())
            }
        }
    }

    /// Answers a preflight from an allowed origin. `None` for anything else.
    pub fn preflight<B>(&self, req: &Request<B>) -> Option<Response<Body>> {
        if req.method() != Method::OPTIONS {
            return None;
        }
        let requested_method = req.headers().get(ACCESS_CONTROL_REQUEST_METHOD)?;
        let allow_origin = self.allow_origin(req.headers().get(ORIGIN)?)?;

        let mut response = StatusCode::NO_CONTENT.into_response();
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);

        let methods = match self.allow_methods {
            // Echo rather than `*`, which browsers ignore with credentials.
            WildcardOrList::Wildcard => Some(requested_method.clone()),
            _ => self.allow_methods.header_value(),
        };
        if let Some(methods) = methods {
            headers.insert(ACCESS_CONTROL_ALLOW_METHODS, methods);
        }

        let allow_headers = match self.allow_headers {
            WildcardOrList::Wildcard => req.headers().get(ACCESS_CONTROL_REQUEST_HEADERS).cloned(),
            _ => self.allow_headers.header_value(),
        };
        if let Some(allow_headers) = allow_headers {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
        }

        if let Some(max_age) = &self.max_age {
            headers.insert(ACCESS_CONTROL_MAX_AGE, max_age.clone());
        }
        self.finish(headers);
        Some(response)
    }

    /// Decorates an actual response for a request that carried `origin`.
    pub fn apply(&self, origin: Option<&HeaderValue>, response: &mut Response<Body>) {
        let Some(allow_origin) = origin.and_then(|o| self.allow_origin(o)) else {
            return;
        };
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        if let Some(expose) = self.expose_headers.header_value() {
            headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, expose);
        }
        self.finish(headers);
    }

    fn finish(&self, headers: &mut http::HeaderMap) {
        if self.allow_credentials {
            headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
        if headers
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_some_and(|v| v != "*")
        {
            headers.append(VARY, HeaderValue::from_static("origin"));
        }
    }
}
