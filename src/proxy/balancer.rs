use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Url;
use std::sync::{
    Arc,
    atomic::{
        AtomicU64,
        Ordering,
    },
};

use crate::{
    error::{GatewayError, GatewayResult},
    proxy::client::{Bound, HttpClient, OutboundRequest, TransportError, UpstreamResponse},
};

pub trait BalancingStrategy: Send + Sync {
    /// Index of the server that takes the next request. `servers` is never empty.
    fn pick(&self, servers: &[Url]) -> usize;
}

#[derive(Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl BalancingStrategy for RoundRobin {
    fn pick(&self, servers: &[Url]) -> usize {
        let seed = self.counter.fetch_add(1, Ordering::Relaxed);
        (seed % servers.len() as u64) as usize
    }
}

#[derive(Default)]
struct ServerStats {
    in_flight: AtomicU64,
    success_total: AtomicU64,
    failure_total: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSnapshot {
    pub in_flight: u64,
    pub success_total: u64,
    pub failure_total: u64,
}

/// Spreads requests over a fixed server list. The outbound URL keeps its path
/// and query; scheme, host and port come from the chosen server.
pub struct BalancingClient {
    servers: Vec<Url>,
    inner: Arc<dyn HttpClient>,
    strategy: Arc<dyn BalancingStrategy>,
    stats: DashMap<String, Arc<ServerStats>>,
}

impl BalancingClient {
    pub fn new(
        servers: &[String],
        inner: Arc<dyn HttpClient>,
        strategy: Arc<dyn BalancingStrategy>,
    ) -> GatewayResult<Self> {
        if servers.is_empty() {
            return Err(GatewayError::Configuration(
                "Servers cannot be empty".to_string(),
            ));
        }

        let servers = servers
            .iter()
            .map(|raw| parse_server(raw))
            .collect::<GatewayResult<Vec<_>>>()?;

        let stats = DashMap::new();
        for server in &servers {
            stats.insert(server_key(server), Arc::new(ServerStats::default()));
        }

        Ok(Self {
            servers,
            inner,
            strategy,
            stats,
        })
    }

    pub fn round_robin(servers: &[String], inner: Arc<dyn HttpClient>) -> GatewayResult<Self> {
        Self::new(servers, inner, Arc::new(RoundRobin::default()))
    }

    pub fn snapshot(&self, server: &str) -> ServerSnapshot {
        self.stats
            .get(server)
            .map(|stats| ServerSnapshot {
                in_flight: stats.in_flight.load(Ordering::Relaxed),
                success_total: stats.success_total.load(Ordering::Relaxed),
                failure_total: stats.failure_total.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl HttpClient for BalancingClient {
    async fn execute(
        &self,
        mut request: OutboundRequest,
        bound: Option<Bound>,
    ) -> Result<UpstreamResponse, TransportError> {
        let server = &self.servers[self.strategy.pick(&self.servers)];
        retarget(&mut request.url, server)?;

        let key = server_key(server);
        let stats = self
            .stats
            .get(&key)
            .map(|s| s.clone())
            .unwrap_or_default();

        tracing::debug!(server = %key, url = %request.url, "balancer selected server");

        stats.in_flight.fetch_add(1, Ordering::Relaxed);
        let outcome = self.inner.execute(request, bound).await;
        stats.in_flight.fetch_sub(1, Ordering::Relaxed);

        match &outcome {
            Ok(_) => stats.success_total.fetch_add(1, Ordering::Relaxed),
            Err(_) => stats.failure_total.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }
}

/// Accepts `host:port` as well as full `http://` / `https://` addresses.
fn parse_server(raw: &str) -> GatewayResult<Url> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };

    let url = Url::parse(&with_scheme)
        .map_err(|e| GatewayError::Configuration(format!("invalid server {raw}: {e}")))?;
    if url.host_str().is_none() {
        return Err(GatewayError::Configuration(format!(
            "server {raw} has no host"
        )));
    }
    Ok(url)
}

fn server_key(url: &Url) -> String {
    match url.port_or_known_default() {
        Some(port) => format!("{}://{}:{port}", url.scheme(), url.host_str().unwrap_or_default()),
        None => format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default()),
    }
}

fn retarget(url: &mut Url, server: &Url) -> Result<(), TransportError> {
    let invalid = || TransportError::InvalidTarget(format!("cannot route request to {server}"));

    url.set_scheme(server.scheme()).map_err(|_| invalid())?;
    url.set_host(server.host_str()).map_err(|_| invalid())?;
    url.set_port(server.port()).map_err(|_| invalid())?;
    Ok(())
}
