use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, Method, StatusCode, header};
use reqwest::Url;
use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::error::{GatewayError, GatewayResult};

/// Largest response header block accepted by default, in bytes.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// How long one proxied call may take. A deadline is shared by every hop of a
/// redirect chain; a timeout restarts on each hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Timeout(Duration),
    Deadline(Instant),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timeout")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("{0}")]
    BufferOverflow(String),
    #[error("invalid upstream url: {0}")]
    InvalidTarget(String),
    #[error("upstream request failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// URL that actually answered.
    pub origin: Url,
}

impl UpstreamResponse {
    /// `Location` of a redirect response, if this is one.
    pub fn redirect_location(&self) -> Option<&str> {
        if !matches!(self.status.as_u16(), 301 | 302 | 303 | 307 | 308) {
            return None;
        }
        self.headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    }

    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if should_forward_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        response
    }
}

/// The outbound HTTP capability the proxy depends on.
///
/// Implementations must be safe to share between concurrent requests. When a
/// bound elapses the proxy stops waiting for the returned future; whether the
/// socket work behind it is torn down is up to the implementation.
/// [`ReqwestClient`] drops the request future, which closes its connection.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(
        &self,
        request: OutboundRequest,
        bound: Option<Bound>,
    ) -> Result<UpstreamResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub read_buffer_size: usize,
    pub max_body_size: Option<usize>,
    pub accept_invalid_certs: bool,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_body_size: None,
            accept_invalid_certs: false,
            pool_idle_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 32,
        }
    }
}

/// Pooled client backed by reqwest. Redirects are never followed here; the
/// proxy decides whether to follow them.
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    read_buffer_size: usize,
    max_body_size: Option<usize>,
}

impl ReqwestClient {
    pub fn new(options: ClientOptions) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(options.pool_idle_timeout)
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            read_buffer_size: options.read_buffer_size,
            max_body_size: options.max_body_size,
        })
    }

    async fn exchange(&self, request: OutboundRequest) -> Result<UpstreamResponse, TransportError> {
        let mut response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let header_bytes: usize = response
            .headers()
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len() + 4)
            .sum();
        if header_bytes > self.read_buffer_size {
            return Err(TransportError::BufferOverflow(format!(
                "response headers of {header_bytes} bytes exceed read buffer of {} bytes",
                self.read_buffer_size
            )));
        }

        let status = response.status();
        let headers = response.headers().clone();
        let origin = response.url().clone();

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
            if let Some(limit) = self.max_body_size
                && body.len() + chunk.len() > limit
            {
                return Err(TransportError::BufferOverflow(format!(
                    "response body exceeds {limit} bytes"
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(UpstreamResponse {
            status,
            headers,
            body: body.freeze(),
            origin,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(
        &self,
        request: OutboundRequest,
        bound: Option<Bound>,
    ) -> Result<UpstreamResponse, TransportError> {
        let exchange = self.exchange(request);
        match bound {
            None => exchange.await,
            Some(Bound::Timeout(limit)) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| TransportError::Timeout)?,
            Some(Bound::Deadline(at)) => {
                tokio::time::timeout_at(tokio::time::Instant::from_std(at), exchange)
                    .await
                    .map_err(|_| TransportError::Timeout)?
            }
        }
    }
}

/// Shared client used when the caller does not inject one.
pub fn default_client() -> GatewayResult<Arc<dyn HttpClient>> {
    static DEFAULT: OnceLock<Arc<ReqwestClient>> = OnceLock::new();

    let client = match DEFAULT.get() {
        Some(client) => client.clone(),
        None => {
            let created = Arc::new(ReqwestClient::new(ClientOptions::default())?);
            DEFAULT.get_or_init(|| created).clone()
        }
    };
    let client: Arc<dyn HttpClient> = client;
    Ok(client)
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }

    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }

    if err.is_connect() {
        TransportError::Connect(message)
    } else if err.is_builder() {
        TransportError::InvalidTarget(message)
    } else {
        TransportError::Other(message)
    }
}

pub(crate) fn should_forward_header(name: &HeaderName) -> bool {
    let lowercase = name.as_str().to_ascii_lowercase();
    !matches!(
        lowercase.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}
