//! # gatehouse
//!
//! An authenticating edge gateway. One front door for a fleet of backend
//! services: every request must carry a valid bearer token issued to the
//! expected party before it is routed and forwarded.
//!
//! ## The contract
//!
//! For each request, in this order, stopping at the first failure:
//!
//! 1. **Token** ([`token`]): signature, expiry, not-before and issuer are
//!    checked against the identity provider's published signing keys.
//!    Anything wrong is `401`.
//! 2. **Authorization** ([`authz`]): the `azp` claim must name the
//!    configured authorized party. Otherwise `403`.
//! 3. **Route** ([`route`]): the first rule in configuration order whose
//!    path and host patterns match picks a cluster. No match is `404`.
//! 4. **Forward** ([`proxy`]): one healthy destination of the cluster gets
//!    the request; its response streams back. Unreachable is `502`.
//!
//! Unauthenticated requests never reach a backend and never learn whether
//! their path exists.
//!
//! What the gateway leaves to the layers around it:
//!
//! - **TLS termination**: a load balancer or ingress in front
//! - **Rate limiting** and **body-size limits**: same
//! - **Retries**: backends and clients decide, the gateway forwards once
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gatehouse::{GatewayConfig, Runtime, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::from_file("gateway.json")?;
//!     let runtime = Runtime::start(&config).await?;
//!
//!     Server::bind(config.listen)
//!         .await?
//!         .serve(runtime.gateway(), config.shutdown_grace())
//!         .await?;
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod authz;
pub mod cluster;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod middleware;
pub mod proxy;
pub mod request;
pub mod response;
pub mod route;
pub mod server;
pub mod token;

pub use authz::{AuthorizationGate, Authorized};
pub use config::{ConfigError, GatewayConfig};
pub use error::{Error, Rejection};
pub use gateway::{Gateway, Runtime};
pub use response::{Body, IntoResponse};
pub use server::Server;
pub use token::{KeyCache, KeySource, Principal, TokenError, TokenValidator};
