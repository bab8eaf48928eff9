use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::{
    Router,
    body::{
        Body,
        to_bytes,
    },
    extract::{
        ConnectInfo,
        State,
    },
    http::{
        HeaderName,
        HeaderValue,
        Request,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use uuid::Uuid;

use crate::{
    config::{
        GatewayConfig,
        RouteConfig,
    },
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        logging::RequestLoggingMiddleware,
        rewrite::RewriteMiddleware,
    },
    proxy::{Balancer, BalancerConfig},
    rewrite::RuleSet,
};

pub struct Gateway {
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    routes: Vec<(RouteConfig, Arc<Balancer>)>,
    max_body_bytes: usize,
}

impl Gateway {
    pub fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        let mut middlewares: Vec<Arc<dyn GatewayMiddleware>> =
            vec![Arc::new(RequestLoggingMiddleware::new(config.log_locals.clone()))];

        let rules = RuleSet::compile(config.rewrite_rules.iter().map(|(p, r)| (p, r)))?;
        if !rules.is_empty() {
            tracing::info!(rules = rules.rules().len(), "path rewriting enabled");
            middlewares.push(Arc::new(RewriteMiddleware::new(Arc::new(rules))));
        }

        let timeout = (config.proxy.timeout_ms > 0)
            .then(|| Duration::from_millis(config.proxy.timeout_ms));

        let mut balancers = HashMap::with_capacity(config.upstreams.len());
        for upstream in &config.upstreams {
            let balancer = Balancer::new(BalancerConfig {
                servers: upstream.servers.clone(),
                timeout,
                read_buffer_size: config.proxy.read_buffer_size,
                max_body_size: config.proxy.max_response_body_bytes,
                accept_invalid_certs: config.proxy.accept_invalid_certs,
                ..BalancerConfig::default()
            })?;
            balancers.insert(upstream.name.clone(), Arc::new(balancer));
        }

        let routes = config
            .routes
            .into_iter()
            .map(|route| {
                let balancer = balancers.get(&route.upstream).cloned().ok_or_else(|| {
                    GatewayError::Configuration(format!(
                        "route {} points at unknown upstream {}",
                        route.path_prefix, route.upstream
                    ))
                })?;
                Ok((route, balancer))
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Self {
            middlewares,
            routes,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(proxy_handler).with_state(self)
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let max_capture = self.max_body_bytes.saturating_add(1);
        let body = match to_bytes(body, max_capture).await {
            Ok(body) if body.len() <= self.max_body_bytes => body,
            _ => {
                let mut response = GatewayError::PayloadTooLarge.into_response();
                self.attach_hardening_headers("unknown", &mut response);
                return response;
            }
        };

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut ctx = RequestContext::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            body,
            client_ip,
        );

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(response)) => {
                    return self.finish(&executed, &ctx, response).await;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = %err,
                        "middleware rejected request"
                    );
                    return self.finish(&executed, &ctx, err.into_response()).await;
                }
            }
        }

        let Some((route, balancer)) = self.resolve_route(ctx.uri.path()) else {
            let response = GatewayError::RouteNotFound.into_response();
            return self.finish(&executed, &ctx, response).await;
        };
        ctx.route = Some(route.clone());

        let response = match balancer.on_request(&mut ctx).await {
            Ok(ControlFlow::ShortCircuit(response)) => response,
            Ok(ControlFlow::Continue) => GatewayError::RouteNotFound.into_response(),
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    route = %route.path_prefix,
                    upstream = %route.upstream,
                    error = %err,
                    "proxy call failed"
                );
                err.into_response()
            }
        };

        self.finish(&executed, &ctx, response).await
    }

    fn resolve_route(&self, path: &str) -> Option<(&RouteConfig, &Balancer)> {
        self.routes
            .iter()
            .filter(|(route, _)| path.starts_with(route.path_prefix.as_str()))
            .max_by_key(|(route, _)| route.path_prefix.len())
            .map(|(route, balancer)| (route, balancer.as_ref()))
    }

    async fn finish(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        mut response: Response<Body>,
    ) -> Response<Body> {
        self.apply_response_middlewares(executed, ctx, &mut response)
            .await;
        self.attach_hardening_headers(&ctx.request_id, &mut response);
        response
    }

    async fn apply_response_middlewares(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err,
                    "middleware post-response hook failed"
                );
            }
        }
    }

    fn attach_hardening_headers(&self, request_id: &str, response: &mut Response<Body>) {
        if let Ok(value) = HeaderValue::from_str(request_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("x-request-id"), value);
        }

        response.headers_mut().insert(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        );
        response.headers_mut().insert(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        );
        response.headers_mut().insert(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        );
    }
}

async fn proxy_handler(
    State(gateway): State<Arc<Gateway>>,
    request: Request<Body>,
) -> Response<Body> {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    gateway.handle_http(request, client_ip).await
}

#[cfg(test)]
mod tests {
    use axum::{
        extract::Request as AxumRequest,
        http::StatusCode,
        routing::get,
    };
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{ProxyConfig, UpstreamConfig};

    async fn spawn(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    async fn spawn_echo() -> String {
        spawn(
            Router::new()
                .route(
                    "/slow",
                    get(|| async {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        "late"
                    }),
                )
                .fallback(|request: AxumRequest| async move { request.uri().to_string() }),
        )
        .await
    }

    fn config(server: String) -> GatewayConfig {
        GatewayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_body_bytes: 16,
            rewrite_rules: vec![("/legacy/*".into(), "/api/$1".into())],
            log_locals: Vec::new(),
            proxy: ProxyConfig {
                timeout_ms: 200,
                ..ProxyConfig::default()
            },
            upstreams: vec![UpstreamConfig {
                name: "api".into(),
                servers: vec![server],
            }],
            routes: vec![RouteConfig {
                path_prefix: "/api".into(),
                upstream: "api".into(),
            }],
        }
    }

    async fn send(gateway: Arc<Gateway>, request: Request<Body>) -> (Response<Body>, String) {
        let response = gateway.router().oneshot(request).await.unwrap();
        let (parts, body) = response.into_parts();
        let bytes = to_bytes(body, usize::MAX).await.unwrap();
        (
            Response::from_parts(parts, Body::empty()),
            String::from_utf8(bytes.to_vec()).unwrap(),
        )
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("host", "gateway.local")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn rewritten_path_is_routed_and_proxied() {
        let gateway = Arc::new(Gateway::from_config(config(spawn_echo().await)).unwrap());

        let (response, body) = send(gateway, get_request("/legacy/items?page=2")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body, "/api/items?page=2");
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(response.headers().get("referrer-policy").unwrap(), "no-referrer");
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let gateway = Arc::new(Gateway::from_config(config(spawn_echo().await)).unwrap());

        let (response, body) = send(gateway, get_request("/elsewhere")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["error"], "route_not_found");
    }

    #[tokio::test]
    async fn slow_upstream_yields_timeout_body() {
        let mut config = config(spawn_echo().await);
        config.routes.push(RouteConfig {
            path_prefix: "/slow".into(),
            upstream: "api".into(),
        });
        let gateway = Arc::new(Gateway::from_config(config).unwrap());

        let (response, body) = send(gateway, get_request("/slow")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "timeout");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let gateway = Arc::new(Gateway::from_config(config(spawn_echo().await)).unwrap());

        let request = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .body(Body::from("x".repeat(64)))
            .unwrap();
        let (response, _) = send(gateway, request).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn request_id_is_propagated() {
        let gateway = Arc::new(Gateway::from_config(config(spawn_echo().await)).unwrap());

        let request = Request::builder()
            .uri("/api/x")
            .header("x-request-id", "fixed-id")
            .body(Body::empty())
            .unwrap();
        let (response, _) = send(gateway, request).await;
        assert_eq!(response.headers().get("x-request-id").unwrap(), "fixed-id");
    }

    #[test]
    fn unknown_upstream_or_duplicate_rule_fails_construction() {
        let mut bad_route = config("127.0.0.1:1".into());
        bad_route.routes[0].upstream = "missing".into();
        assert!(matches!(
            Gateway::from_config(bad_route),
            Err(GatewayError::Configuration(_))
        ));

        let mut duplicate = config("127.0.0.1:1".into());
        duplicate
            .rewrite_rules
            .push(("/legacy/*".into(), "/other/$1".into()));
        assert!(matches!(
            Gateway::from_config(duplicate),
            Err(GatewayError::Configuration(_))
        ));
    }
}
