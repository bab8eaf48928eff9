//! One proxied request, start to finish.
//!
//! ```text
//! Start -> Dispatch -> Success
//!                   -> Timeout | TransportError
//!                   -> Redirect (budget > 0)  -> Dispatch
//!                   -> Redirect (budget == 0) -> TooManyRedirects
//! ```
//!
//! The context's `uri` points at the upstream while the call is in flight and
//! is put back to the client's URI on every exit, including cancellation.

use axum::{
    body::Body,
    response::Response,
};
use http::{HeaderValue, Method, StatusCode, Uri, header};
use reqwest::Url;
use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    proxy::client::{
        Bound, HttpClient, OutboundRequest, TransportError, UpstreamResponse, default_client,
        should_forward_header,
    },
};

pub type RequestHook = Arc<dyn Fn(&mut RequestContext) -> anyhow::Result<()> + Send + Sync>;
pub type ResponseHook =
    Arc<dyn Fn(&RequestContext, &mut UpstreamResponse) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ProxyOptions {
    pub bound: Option<Bound>,
    /// `None` returns redirect responses as they are; `Some(n)` follows up to
    /// `n` hops.
    pub max_redirects: Option<usize>,
    pub modify_request: Option<RequestHook>,
    pub modify_response: Option<ResponseHook>,
}

#[derive(Clone)]
pub struct Proxy {
    client: Arc<dyn HttpClient>,
}

impl Proxy {
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }

    /// Uses the injected client, or the shared default one.
    pub fn with_client(client: Option<Arc<dyn HttpClient>>) -> GatewayResult<Self> {
        match client {
            Some(client) => Ok(Self::new(client)),
            None => Ok(Self::new(default_client()?)),
        }
    }

    pub async fn execute(
        &self,
        ctx: &mut RequestContext,
        target: &str,
        options: &ProxyOptions,
    ) -> GatewayResult<Response<Body>> {
        let mut ctx = RestoreUri::new(ctx);
        self.run(&mut ctx, target, options).await
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        target: &str,
        options: &ProxyOptions,
    ) -> GatewayResult<Response<Body>> {
        let mut url = parse_target(target)?;
        ctx.uri = to_uri(&url)?;

        if let Some(hook) = &options.modify_request {
            hook(ctx).map_err(|e| GatewayError::Hook(e.to_string()))?;
            url = parse_target(&ctx.uri.to_string())?;
        }

        let mut method = ctx.method.clone();
        let mut body = ctx.body.clone();
        let mut budget = options.max_redirects;

        let mut response = loop {
            tracing::debug!(
                request_id = %ctx.request_id,
                method = %method,
                upstream = %url,
                "dispatching upstream request"
            );

            let request = OutboundRequest {
                method: method.clone(),
                url: url.clone(),
                headers: outbound_headers(ctx, body.len()),
                body: body.clone(),
            };

            let response = match self.client.execute(request, options.bound).await {
                Ok(response) => response,
                Err(err) => {
                    log_transport_error(ctx, &url, &err);
                    return Err(err.into());
                }
            };

            let Some(remaining) = budget else {
                break response;
            };
            let Some(location) = response.redirect_location() else {
                break response;
            };

            if remaining == 0 {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    upstream = %url,
                    limit = ?options.max_redirects,
                    "redirect budget exhausted"
                );
                return Err(GatewayError::TooManyRedirects);
            }
            budget = Some(remaining - 1);

            let next = url.join(location).map_err(|e| {
                GatewayError::from(TransportError::InvalidTarget(format!("{location}: {e}")))
            })?;

            if response.status == StatusCode::SEE_OTHER
                || (method == Method::POST
                    && !matches!(
                        response.status,
                        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
                    ))
            {
                if method != Method::HEAD {
                    method = Method::GET;
                }
                body = Default::default();
            }

            tracing::debug!(
                request_id = %ctx.request_id,
                status = %response.status,
                from = %url,
                to = %next,
                "following upstream redirect"
            );
            url = next;
            ctx.uri = to_uri(&url)?;
        };

        ctx.chosen_upstream = Some(response.origin.to_string());

        if let Some(hook) = &options.modify_response {
            hook(ctx, &mut response).map_err(|e| GatewayError::Hook(e.to_string()))?;
        }

        Ok(response.into_response())
    }
}

/// Puts the context's URI back when dropped.
struct RestoreUri<'a> {
    ctx: &'a mut RequestContext,
    original: Uri,
}

impl<'a> RestoreUri<'a> {
    fn new(ctx: &'a mut RequestContext) -> Self {
        let original = ctx.uri.clone();
        Self { ctx, original }
    }
}

impl Deref for RestoreUri<'_> {
    type Target = RequestContext;

    fn deref(&self) -> &RequestContext {
        self.ctx
    }
}

impl DerefMut for RestoreUri<'_> {
    fn deref_mut(&mut self) -> &mut RequestContext {
        self.ctx
    }
}

impl Drop for RestoreUri<'_> {
    fn drop(&mut self) {
        self.ctx.uri = std::mem::take(&mut self.original);
    }
}

/// Absolute `http(s)` URLs are used as-is; anything else is taken as
/// `host[:port][/path]` over plain HTTP.
fn parse_target(target: &str) -> GatewayResult<Url> {
    let target = target.trim();
    let parsed = if target.starts_with("http://") || target.starts_with("https://") {
        Url::parse(target)
    } else {
        Url::parse(&format!("http://{target}"))
    };

    parsed
        .ok()
        .filter(|url| url.host_str().is_some())
        .ok_or_else(|| TransportError::InvalidTarget(target.to_string()).into())
}

fn to_uri(url: &Url) -> GatewayResult<Uri> {
    url.as_str()
        .parse()
        .map_err(|_| TransportError::InvalidTarget(url.to_string()).into())
}

fn outbound_headers(ctx: &RequestContext, body_len: usize) -> http::HeaderMap {
    let mut headers = http::HeaderMap::with_capacity(ctx.headers.len() + 2);
    for (name, value) in &ctx.headers {
        if should_forward_header(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert("x-request-id", value);
    }
    if let Some(client_ip) = ctx.client_ip
        && let Ok(value) = HeaderValue::from_str(&client_ip.to_string())
    {
        headers.insert("x-forwarded-for", value);
    }
    if body_len == 0 {
        headers.remove(header::CONTENT_TYPE);
    }
    headers
}

fn log_transport_error(ctx: &RequestContext, url: &Url, err: &TransportError) {
    match err {
        TransportError::Timeout => tracing::warn!(
            request_id = %ctx.request_id,
            upstream = %url,
            "upstream request timed out"
        ),
        other => tracing::warn!(
            request_id = %ctx.request_id,
            upstream = %url,
            error = %other,
            "upstream request failed"
        ),
    }
}

/// Proxies to `addr` without following redirects.
pub async fn do_request(
    ctx: &mut RequestContext,
    addr: &str,
    client: Option<Arc<dyn HttpClient>>,
) -> GatewayResult<Response<Body>> {
    Proxy::with_client(client)?
        .execute(ctx, addr, &ProxyOptions::default())
        .await
}

/// Proxies to `addr`, following at most `max_redirects` redirects.
pub async fn do_redirects(
    ctx: &mut RequestContext,
    addr: &str,
    max_redirects: usize,
    client: Option<Arc<dyn HttpClient>>,
) -> GatewayResult<Response<Body>> {
    let options = ProxyOptions {
        max_redirects: Some(max_redirects),
        ..ProxyOptions::default()
    };
    Proxy::with_client(client)?.execute(ctx, addr, &options).await
}

pub async fn do_timeout(
    ctx: &mut RequestContext,
    addr: &str,
    timeout: Duration,
    client: Option<Arc<dyn HttpClient>>,
) -> GatewayResult<Response<Body>> {
    let options = ProxyOptions {
        bound: Some(Bound::Timeout(timeout)),
        ..ProxyOptions::default()
    };
    Proxy::with_client(client)?.execute(ctx, addr, &options).await
}

pub async fn do_deadline(
    ctx: &mut RequestContext,
    addr: &str,
    deadline: Instant,
    client: Option<Arc<dyn HttpClient>>,
) -> GatewayResult<Response<Body>> {
    let options = ProxyOptions {
        bound: Some(Bound::Deadline(deadline)),
        ..ProxyOptions::default()
    };
    Proxy::with_client(client)?.execute(ctx, addr, &options).await
}
