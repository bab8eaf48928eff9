use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashSet,
    env,
    net::SocketAddr,
};

use crate::proxy::client::DEFAULT_READ_BUFFER_SIZE;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    /// Largest inbound request body buffered before proxying.
    pub max_body_bytes: usize,
    /// Ordered `(pattern, replacement)` pairs.
    pub rewrite_rules: Vec<(String, String)>,
    pub log_locals: Vec<String>,
    pub proxy: ProxyConfig,
    pub upstreams: Vec<UpstreamConfig>,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Zero leaves proxied calls unbounded.
    pub timeout_ms: u64,
    pub read_buffer_size: usize,
    pub max_response_body_bytes: Option<usize>,
    pub accept_invalid_certs: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_response_body_bytes: None,
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub name: String,
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub upstream: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let rewrite_rules = parse_rewrite_rules(&env::var("REWRITE_RULES").unwrap_or_default())
            .context("invalid REWRITE_RULES")?;

        let proxy = ProxyConfig {
            timeout_ms: parse_env("PROXY_TIMEOUT_MS", 0u64),
            read_buffer_size: parse_env("PROXY_READ_BUFFER_SIZE", DEFAULT_READ_BUFFER_SIZE),
            max_response_body_bytes: env::var("PROXY_MAX_BODY_BYTES")
                .ok()
                .and_then(|s| s.parse::<usize>().ok()),
            accept_invalid_certs: parse_env("PROXY_ACCEPT_INVALID_CERTS", false),
        };

        let upstreams = parse_upstreams(
            &env::var("UPSTREAMS")
                .unwrap_or_else(|_| "svc-a=127.0.0.1:9001|127.0.0.1:9002".into()),
        )
        .context("invalid UPSTREAMS")?;

        let routes = parse_routes(&env::var("ROUTES").unwrap_or_else(|_| "/=svc-a".into()))
            .context("invalid ROUTES")?;

        let known = upstreams
            .iter()
            .map(|u| u.name.as_str())
            .collect::<HashSet<_>>();
        if let Some(route) = routes.iter().find(|r| !known.contains(r.upstream.as_str())) {
            return Err(anyhow!(
                "route {} points at unknown upstream {}",
                route.path_prefix,
                route.upstream
            ));
        }

        Ok(Self {
            bind_addr,
            max_body_bytes: parse_env("MAX_BODY_BYTES", 1_048_576usize),
            rewrite_rules,
            log_locals: parse_csv("LOG_LOCALS", ""),
            proxy,
            upstreams,
            routes,
        })
    }
}

/// `pattern=replacement` pairs separated by commas; order is kept.
fn parse_rewrite_rules(raw: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (pattern, replacement) = chunk
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid rewrite entry: {chunk}"))?;
        out.push((pattern.trim().to_string(), replacement.trim().to_string()));
    }
    Ok(out)
}

fn parse_upstreams(raw: &str) -> Result<Vec<UpstreamConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let mut parts = chunk.splitn(2, '=');
        let name = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("invalid upstream entry: {chunk}"))?
            .to_string();

        let servers = parts
            .next()
            .map(str::trim)
            .ok_or_else(|| anyhow!("invalid upstream entry: {chunk}"))?
            .split('|')
            .map(|s| s.trim().trim_end_matches('/'))
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();

        if servers.is_empty() {
            return Err(anyhow!("upstream {name} has no servers"));
        }

        out.push(UpstreamConfig { name, servers });
    }

    if out.is_empty() {
        return Err(anyhow!("no upstreams configured"));
    }
    Ok(out)
}

fn parse_routes(raw: &str) -> Result<Vec<RouteConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let mut parts = chunk.splitn(2, '=');
        let path_prefix = parts
            .next()
            .map(str::trim)
            .filter(|s| s.starts_with('/'))
            .ok_or_else(|| anyhow!("invalid route entry: {chunk}"))?
            .to_string();

        let upstream = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("route has no upstream: {chunk}"))?
            .to_string();

        out.push(RouteConfig {
            path_prefix,
            upstream,
        });
    }

    if out.is_empty() {
        return Err(anyhow!("no routes configured"));
    }
    Ok(out)
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_rules_keep_their_order() {
        let rules = parse_rewrite_rules("/old=/new, /users/*/orders/*=/user/$1/order/$2").unwrap();
        assert_eq!(
            rules,
            vec![
                ("/old".to_string(), "/new".to_string()),
                ("/users/*/orders/*".to_string(), "/user/$1/order/$2".to_string()),
            ]
        );
        assert!(parse_rewrite_rules("").unwrap().is_empty());
        assert!(parse_rewrite_rules("/missing-replacement").is_err());
    }

    #[test]
    fn upstreams_split_servers() {
        let upstreams =
            parse_upstreams("api=127.0.0.1:9001|https://api.internal/,web=127.0.0.1:9100").unwrap();
        assert_eq!(upstreams.len(), 2);
        assert_eq!(upstreams[0].name, "api");
        assert_eq!(
            upstreams[0].servers,
            vec!["127.0.0.1:9001", "https://api.internal"]
        );
        assert_eq!(upstreams[1].servers, vec!["127.0.0.1:9100"]);

        assert!(parse_upstreams("api=").is_err());
        assert!(parse_upstreams("").is_err());
    }

    #[test]
    fn routes_require_prefix_and_upstream() {
        let routes = parse_routes("/=web,/api=api").unwrap();
        assert_eq!(
            routes[1],
            RouteConfig {
                path_prefix: "/api".into(),
                upstream: "api".into(),
            }
        );

        assert!(parse_routes("api=api").is_err());
        assert!(parse_routes("/api=").is_err());
    }
}
