//! Shared fixtures: a token minter, recording backends and a gateway wired
//! to static signing keys.

#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use gatehouse::token::StaticKeys;
use gatehouse::{Body, Gateway, GatewayConfig, KeyCache};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode, get_current_timestamp};
use serde_json::{Value, json};
use tokio::net::TcpListener;

pub const ISSUER: &str = "https://issuer.test";
pub const APP: &str = "https://app.test";
pub const KID: &str = "gw-test-1";
const SECRET: &[u8] = b"integration-test-signing-secret";

pub fn claims() -> Value {
    json!({
        "sub": "user_42",
        "iss": ISSUER,
        "azp": APP,
        "exp": get_current_timestamp() + 600,
    })
}

pub fn mint(claims: Value) -> String {
    mint_with_secret(SECRET, claims)
}

/// Signed under the trusted `kid` but with an arbitrary secret.
pub fn mint_with_secret(secret: &[u8], claims: Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(KID.to_owned());
    encode(&header, &claims, &EncodingKey::from_secret(secret)).unwrap()
}

pub fn bearer() -> String {
    format!("Bearer {}", mint(claims()))
}

fn jwks() -> JwkSet {
    serde_json::from_value(json!({
        "keys": [{ "kty": "oct", "kid": KID, "alg": "HS256", "k": URL_SAFE_NO_PAD.encode(SECRET) }]
    }))
    .unwrap()
}

/// A backend that answers every request with `status` and reports what it
/// received. Requests to `/healthz` are answered but not counted.
pub struct Backend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl Backend {
    pub async fn start(name: &'static str, status: StatusCode) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let addr = listen(move |req| {
            let counter = Arc::clone(&counter);
            async move { respond(name, status, &counter, req).await }
        })
        .await;
        Self { addr, hits }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn respond(
    name: &str,
    status: StatusCode,
    hits: &AtomicUsize,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if req.uri().path() == "/healthz" {
        let mut response = Response::new(Full::default());
        *response.status_mut() = status;
        return response;
    }
    hits.fetch_add(1, Ordering::SeqCst);

    let (parts, body) = req.into_parts();
    let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
    let seen = |header: &str| {
        parts
            .headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_owned()
    };

    Response::builder()
        .status(status)
        .header("x-backend", name)
        .header("x-seen-method", parts.method.as_str())
        .header("x-seen-uri", parts.uri.to_string())
        .header("x-seen-host", seen("host"))
        .header("x-seen-authorization", seen("authorization"))
        .header("x-seen-proxy-authorization", seen("proxy-authorization"))
        .header("x-seen-session-hint", seen("x-session-hint"))
        .header("proxy-authenticate", "Basic realm=\"backend\"")
        .body(Full::new(body))
        .unwrap()
}

/// Serves HTTP/1.1 on an ephemeral port, answering each request with
/// `handler`.
pub async fn listen<F, Fut, B>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<B>> + Send + 'static,
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req| {
                    let response = handler(req);
                    async move { Ok::<_, Infallible>(response.await) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });
    addr
}

/// Answers with the headers and `first` at once, then `second` after `gap`.
pub struct TrickleBody {
    first: Option<Bytes>,
    second: Option<Bytes>,
    gap: Pin<Box<tokio::time::Sleep>>,
}

impl TrickleBody {
    pub fn new(first: &'static str, second: &'static str, gap: Duration) -> Self {
        Self {
            first: Some(Bytes::from_static(first.as_bytes())),
            second: Some(Bytes::from_static(second.as_bytes())),
            gap: Box::pin(tokio::time::sleep(gap)),
        }
    }
}

impl hyper::body::Body for TrickleBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        if let Some(first) = self.first.take() {
            return Poll::Ready(Some(Ok(Frame::data(first))));
        }
        if self.second.is_none() {
            return Poll::Ready(None);
        }
        ready!(self.gap.as_mut().poll(cx));
        Poll::Ready(self.second.take().map(|second| Ok(Frame::data(second))))
    }
}

/// A port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Parses `config` (the `auth` section is filled in) and builds a gateway
/// trusting the test signing key.
pub async fn gateway(mut config: Value) -> Arc<Gateway> {
    config["auth"] = json!({
        "authority": ISSUER,
        "authorized_party": APP,
        "algorithms": ["HS256"],
        "clock_skew_secs": 0,
    });
    let config = GatewayConfig::from_json(&config.to_string()).unwrap();
    let keys = KeyCache::bootstrap(
        Arc::new(StaticKeys::new(jwks())),
        Duration::from_secs(300),
        Duration::from_secs(1),
    )
    .await
    .unwrap();
    Arc::new(Gateway::from_config(&config, Arc::new(keys), gatehouse::proxy::http_client()).unwrap())
}

pub fn body(bytes: impl Into<Bytes>) -> Body {
    gatehouse::response::full(bytes)
}

pub async fn read_body(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
