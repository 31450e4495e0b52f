//! Accept loop and graceful shutdown.
//!
//! On SIGTERM or Ctrl-C the server stops accepting and asks every open
//! connection to close once its in-flight requests are answered: idle HTTP/1.1
//! keep-alive connections close at once, HTTP/2 connections get a GOAWAY.
//! Connections still busy after `grace` are aborted. Under
//! Kubernetes keep `shutdown_grace_secs` below the pod's
//! `terminationGracePeriodSeconds`, or SIGKILL arrives first.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::gateway::Gateway;
use crate::proxy::ClientAddr;
use crate::response::Body;

/// The HTTP front door. Binds eagerly so the caller learns about a taken
/// port before any traffic is expected.
pub struct Server {
    listener: TcpListener,
}

impl Server {
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until SIGTERM or Ctrl-C, then drains for at most `grace`.
    pub async fn serve(self, gateway: Arc<Gateway>, grace: Duration) -> Result<(), Error> {
        self.serve_with_shutdown(gateway, grace, shutdown_signal()).await
    }

    /// Like [`serve`](Server::serve), stopping when `signal` resolves.
    pub async fn serve_with_shutdown(
        self,
        gateway: Arc<Gateway>,
        grace: Duration,
        signal: impl Future<Output = ()>,
    ) -> Result<(), Error> {
        let listener = self.listener;
        info!(addr = %listener.local_addr()?, "gatehouse listening");

        // One task per connection, kept for the drain.
        let mut tasks = JoinSet::new();
        let (draining_tx, draining) = watch::channel(false);

        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Checked first so a shutdown stops accepting immediately,
                // even if more connections are queued.
                biased;

                () = &mut signal => {
                    info!(connections = tasks.len(), "shutdown signal received, draining connections");
                    draining_tx.send_modify(|draining| *draining = true);
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let gateway = Arc::clone(&gateway);
                    let io = TokioIo::new(stream);
                    let mut draining = draining.clone();

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            let gateway = Arc::clone(&gateway);
                            async move { dispatch(&gateway, req, remote_addr).await }
                        });

                        // HTTP/1.1 or HTTP/2, whatever the client negotiates.
                        let builder = ConnBuilder::new(TokioExecutor::new());
                        let conn = builder.serve_connection(io, svc);
                        tokio::pin!(conn);

                        let result = tokio::select! {
                            res = conn.as_mut() => res,
                            _ = draining.changed() => {
                                conn.as_mut().graceful_shutdown();
                                conn.as_mut().await
                            }
                        };
                        if let Err(e) = result {
                            warn!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connections.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(listener);
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                grace_secs = grace.as_secs(),
                "grace period elapsed, aborting connections"
            );
            tasks.shutdown().await;
        }

        info!("gatehouse stopped");
        Ok(())
    }
}

/// Every failure is already a response by the time the gateway returns, so
/// hyper never sees an error.
async fn dispatch(
    gateway: &Gateway,
    req: hyper::Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Body>, Infallible> {
    let mut req = req.map(BodyExt::boxed_unsync);
    req.extensions_mut().insert(ClientAddr(remote_addr));
    Ok(gateway.handle(req).await)
}

/// SIGTERM or Ctrl-C, whichever comes first. A signal whose handler cannot
/// be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
