//! Active destination health probing.
//!
//! Health is decided out of band, never on the request path. For each
//! cluster with a `health_check`, one background task wakes every
//! `interval`, sends `GET {destination}{path}` to every destination and
//! records the outcome:
//!
//! | Probe result | Destination state |
//! |---|---|
//! | 2xx within `timeout` | healthy |
//! | anything else, refused, or timed out | unhealthy |
//!
//! Clusters without a probe keep every destination healthy forever.

use std::sync::Arc;

use http::Request;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::cluster::{Cluster, Destination, HealthCheck};
use crate::proxy::{HttpClient, target_uri};
use crate::response::empty;

pub struct HealthProber {
    cluster: Arc<Cluster>,
    check: HealthCheck,
    client: HttpClient,
}

impl HealthProber {
    /// `None` when the cluster has no probe configured.
    pub fn for_cluster(cluster: Arc<Cluster>, client: HttpClient) -> Option<Self> {
        let check = cluster.health_check()?.clone();
        Some(Self { cluster, check, client })
    }

    /// Probes forever. Stop it by aborting its task.
    pub async fn run(self) {
        info!(
            cluster = self.cluster.id(),
            path = %self.check.path,
            interval_ms = self.check.interval.as_millis() as u64,
            "health probing started"
        );
        let mut ticker = tokio::time::interval(self.check.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.probe_all().await;
        }
    }

    /// One round over every destination of the cluster.
    pub async fn probe_all(&self) {
        for destination in self.cluster.destinations() {
            let healthy = self.probe(destination).await;
            let was_healthy = destination.set_healthy(healthy);
            if healthy != was_healthy {
                if healthy {
                    info!(cluster = self.cluster.id(), destination = destination.id(), "destination healthy");
                } else {
                    warn!(cluster = self.cluster.id(), destination = destination.id(), "destination unhealthy");
                }
            }
        }
    }

    async fn probe(&self, destination: &Destination) -> bool {
        let Ok(uri) = target_uri(destination.address(), &self.check.path) else {
            return false;
        };
        let Ok(req) = Request::get(uri).body(empty()) else {
            return false;
        };
        match tokio::time::timeout(self.check.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::time::Duration;

    use http::{StatusCode, Uri};
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    use super::*;
    use crate::cluster::LoadBalancingPolicy;
    use crate::proxy::http_client;

    /// Answers every request with `status`.
    async fn backend(status: StatusCode) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let svc = service_fn(move |_req| async move {
                        let mut response = http::Response::new(empty());
                        *response.status_mut() = status;
                        Ok::<_, Infallible>(response)
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });
        addr
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn cluster(addrs: &[SocketAddr]) -> Arc<Cluster> {
        let config = serde_json::json!({
            "destinations": addrs
                .iter()
                .enumerate()
                .map(|(i, a)| (format!("d{i}"), serde_json::json!({ "address": format!("http://{a}") })))
                .collect::<serde_json::Map<_, _>>(),
            "health_check": { "path": "/healthz", "timeout_secs": 1 }
        });
        Arc::new(Cluster::from_config("probed", &serde_json::from_value(config).unwrap()).unwrap())
    }

    #[tokio::test]
    async fn probe_marks_failing_destinations_unhealthy() {
        let ok = backend(StatusCode::OK).await;
        let sick = backend(StatusCode::SERVICE_UNAVAILABLE).await;
        let gone = closed_port().await;
        let cluster = cluster(&[ok, sick, gone]);

        let prober = HealthProber::for_cluster(Arc::clone(&cluster), http_client()).unwrap();
        prober.probe_all().await;

        let states: Vec<bool> = cluster.destinations().iter().map(|d| d.is_healthy()).collect();
        assert_eq!(states, [true, false, false]);
    }

    #[tokio::test]
    async fn recovered_destination_is_marked_healthy_again() {
        let ok = backend(StatusCode::NO_CONTENT).await;
        let cluster = cluster(&[ok]);
        cluster.destinations()[0].set_healthy(false);

        HealthProber::for_cluster(Arc::clone(&cluster), http_client())
            .unwrap()
            .probe_all()
            .await;
        assert!(cluster.destinations()[0].is_healthy());
    }

    #[tokio::test]
    async fn clusters_without_probe_get_no_prober() {
        let cluster = Arc::new(
            Cluster::new(
                "plain",
                vec![Destination::new("d", Uri::from_static("http://127.0.0.1:1"))],
                LoadBalancingPolicy::RoundRobin,
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        assert!(HealthProber::for_cluster(cluster, http_client()).is_none());
    }
}
