use async_trait::async_trait;
use http::{HeaderValue, uri::Authority};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware, Skip},
    proxy::{
        balancer::BalancingClient,
        client::{Bound, ClientOptions, DEFAULT_READ_BUFFER_SIZE, HttpClient, ReqwestClient},
        orchestrator::{Proxy, ProxyOptions, RequestHook, ResponseHook},
    },
};

#[derive(Clone)]
pub struct BalancerConfig {
    /// Returning `true` passes the request on untouched.
    pub next: Option<Skip>,
    /// `host:port` or full `http(s)://` addresses.
    pub servers: Vec<String>,
    pub modify_request: Option<RequestHook>,
    pub modify_response: Option<ResponseHook>,
    /// Per-hop limit on a proxied call. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Largest response header block accepted, in bytes.
    pub read_buffer_size: usize,
    pub max_body_size: Option<usize>,
    pub accept_invalid_certs: bool,
    /// Replaces the built-in client; `servers` is ignored when set. The
    /// request URL then carries the client's `Host` (or `localhost`), so a
    /// custom client must pick the upstream itself.
    pub client: Option<Arc<dyn HttpClient>>,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            next: None,
            servers: Vec::new(),
            modify_request: None,
            modify_response: None,
            timeout: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_body_size: None,
            accept_invalid_certs: false,
            client: None,
        }
    }
}

/// Proxies every request it sees to one of a set of servers.
pub struct Balancer {
    next: Option<Skip>,
    proxy: Proxy,
    options: ProxyOptions,
}

impl Balancer {
    pub fn new(config: BalancerConfig) -> GatewayResult<Self> {
        let client: Arc<dyn HttpClient> = match config.client {
            Some(client) => client,
            None => {
                let inner = Arc::new(ReqwestClient::new(ClientOptions {
                    read_buffer_size: config.read_buffer_size,
                    max_body_size: config.max_body_size,
                    accept_invalid_certs: config.accept_invalid_certs,
                    ..ClientOptions::default()
                })?);
                Arc::new(BalancingClient::round_robin(&config.servers, inner)?)
            }
        };

        Ok(Self {
            next: config.next,
            proxy: Proxy::new(client),
            options: ProxyOptions {
                bound: config.timeout.map(Bound::Timeout),
                max_redirects: None,
                modify_request: config.modify_request,
                modify_response: config.modify_response,
            },
        })
    }
}

#[async_trait]
impl GatewayMiddleware for Balancer {
    fn name(&self) -> &'static str {
        "proxy-balancer"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if let Some(skip) = &self.next
            && skip(ctx)
        {
            return Ok(ControlFlow::Continue);
        }

        // Scheme and authority are replaced by the balancing client. A Host
        // that is not a plain authority must not leak into the path.
        let path = ctx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let authority = ctx
            .host()
            .and_then(|host| Authority::try_from(host).ok())
            .filter(|authority| !authority.as_str().contains('@'));
        let target = match authority {
            Some(authority) => format!("http://{authority}{path}"),
            None => format!("http://localhost{path}"),
        };

        let response = self.proxy.execute(ctx, &target, &self.options).await?;
        Ok(ControlFlow::ShortCircuit(response))
    }
}

/// Proxies every request to one fixed address.
pub struct Forward {
    addr: String,
    proxy: Proxy,
}

impl Forward {
    pub fn new(addr: impl Into<String>, client: Option<Arc<dyn HttpClient>>) -> GatewayResult<Self> {
        Ok(Self {
            addr: addr.into(),
            proxy: Proxy::with_client(client)?,
        })
    }
}

#[async_trait]
impl GatewayMiddleware for Forward {
    fn name(&self) -> &'static str {
        "proxy-forward"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let response = self
            .proxy
            .execute(ctx, &self.addr, &ProxyOptions::default())
            .await?;
        Ok(ControlFlow::ShortCircuit(response))
    }
}

/// Proxies to `addr` only when the request's `Host` is `hostname`.
pub struct DomainForward {
    hostname: String,
    addr: String,
    proxy: Proxy,
}

impl DomainForward {
    pub fn new(
        hostname: impl Into<String>,
        addr: impl Into<String>,
        client: Option<Arc<dyn HttpClient>>,
    ) -> GatewayResult<Self> {
        Ok(Self {
            hostname: hostname.into(),
            addr: addr.into(),
            proxy: Proxy::with_client(client)?,
        })
    }
}

#[async_trait]
impl GatewayMiddleware for DomainForward {
    fn name(&self) -> &'static str {
        "proxy-domain-forward"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if ctx.host() != Some(self.hostname.as_str()) {
            return Ok(ControlFlow::Continue);
        }

        let target = format!("{}{}", self.addr, ctx.original_url());
        let response = self
            .proxy
            .execute(ctx, &target, &ProxyOptions::default())
            .await?;
        Ok(ControlFlow::ShortCircuit(response))
    }
}

/// Round-robin over `servers`, keeping the client's path and query.
pub struct BalancerForward {
    servers: Vec<String>,
    counter: AtomicU64,
    proxy: Proxy,
}

impl BalancerForward {
    pub fn new(servers: Vec<String>, client: Option<Arc<dyn HttpClient>>) -> GatewayResult<Self> {
        if servers.is_empty() {
            return Err(GatewayError::Configuration(
                "Servers cannot be empty".to_string(),
            ));
        }

        let servers = servers
            .into_iter()
            .map(|server| {
                if server.starts_with("http") {
                    server
                } else {
                    format!("http://{server}")
                }
            })
            .collect();

        Ok(Self {
            servers,
            counter: AtomicU64::new(0),
            proxy: Proxy::with_client(client)?,
        })
    }
}

#[async_trait]
impl GatewayMiddleware for BalancerForward {
    fn name(&self) -> &'static str {
        "proxy-balancer-forward"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % self.servers.len() as u64;
        let target = format!("{}{}", self.servers[idx as usize], ctx.original_url());

        if let Some(ip) = ctx.client_ip
            && let Ok(value) = HeaderValue::from_str(&ip.to_string())
        {
            ctx.headers.insert("x-real-ip", value);
        }

        let response = self
            .proxy
            .execute(ctx, &target, &ProxyOptions::default())
            .await?;
        Ok(ControlFlow::ShortCircuit(response))
    }
}
