//! Cross-cutting layers wrapped around the admission pipeline.
//!
//! - [`cors`] answers preflights and decorates every response
//! - [`trace`] logs one event per request with method, path, status, latency

pub mod cors;
pub mod trace;

pub use cors::CorsPolicy;
pub use trace::RequestLog;
