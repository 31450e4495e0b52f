//! Per-request access log.

use std::time::Instant;

use http::{Method, Request, StatusCode};
use tracing::{info, warn};

/// Started when a request arrives, finished with the response status.
///
/// Latency is measured to response headers; streamed bodies keep flowing
/// after the event is written.
pub struct RequestLog {
    method: Method,
    path: String,
    started: Instant,
}

impl RequestLog {
    pub fn start<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            path: req.uri().path().to_owned(),
            started: Instant::now(),
        }
    }

    pub fn finish(self, status: StatusCode) {
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1_000.0;
        if status.is_server_error() {
            warn!(method = %self.method, path = %self.path, status = status.as_u16(), elapsed_ms, "request completed");
        } else {
            info!(method = %self.method, path = %self.path, status = status.as_u16(), elapsed_ms, "request completed");
        }
    }
}
