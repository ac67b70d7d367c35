use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use sha2::{Digest, Sha256};

use crate::config;
use crate::metrics;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Cluster membership. Immutable after construction; membership changes
/// require a process restart.
#[derive(Debug, Clone)]
pub struct Cluster {
    secret: String,
    addr: String,
    nodes: HashSet<String>,
}

impl Cluster {
    pub fn new(secret: impl Into<String>, addr: impl Into<String>, nodes: &[config::Node]) -> Self {
        Self {
            secret: secret.into(),
            addr: addr.into(),
            nodes: nodes.iter().map(|node| node.addr.clone()).collect(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn local_node(&self) -> &str {
        &self.addr
    }

    /// Rendezvous (highest random weight) hashing: the node whose hash of
    /// `node || key` is highest owns the key, so removing or adding any
    /// other node leaves the assignment untouched.
    pub fn target_node(&self, key: &str) -> Option<&str> {
        self.nodes
            .iter()
            .max_by(|a, b| {
                score(a.as_str(), key)
                    .cmp(&score(b.as_str(), key))
                    .then_with(|| a.cmp(b))
            })
            .map(String::as_str)
    }

    pub fn contains_node(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    pub fn nodes(&self) -> Vec<String> {
        self.nodes.iter().cloned().collect()
    }
}

fn score(node: &str, key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(node.as_bytes());
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// Periodically probes every member's `/health` endpoint and records the
/// outcome in the node health gauge.
pub fn spawn_health_task(cluster: Arc<Cluster>, client: Client<HttpConnector, Full<Bytes>>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            ticker.tick().await;
            for node in cluster.nodes() {
                let client = client.clone();
                tokio::spawn(async move {
                    let healthy = node_is_healthy(&client, &node).await;
                    metrics::set_node_health(&node, healthy);
                });
            }
        }
    });
}

async fn node_is_healthy(client: &Client<HttpConnector, Full<Bytes>>, node: &str) -> bool {
    let request = match Request::builder()
        .method(Method::GET)
        .uri(format!("http://{node}/health"))
        .body(Full::new(Bytes::new()))
    {
        Ok(request) => request,
        Err(err) => {
            log::warn!("failed to perform health check of the cluster node {node}: {err}");
            return false;
        }
    };

    match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, client.request(request)).await {
        Ok(Ok(response)) => {
            if response.status() != StatusCode::OK {
                log::warn!(
                    "failed to perform health check of the cluster node {node}: \
                     expected HTTP 200, got HTTP {}",
                    response.status()
                );
                return false;
            }
            true
        }
        Ok(Err(err)) => {
            log::warn!("failed to perform health check of the cluster node {node}: {err}");
            false
        }
        Err(_) => {
            log::warn!("failed to perform health check of the cluster node {node}: timed out");
            false
        }
    }
}
