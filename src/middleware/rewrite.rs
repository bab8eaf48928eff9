use async_trait::async_trait;
use http::{Uri, uri::PathAndQuery};
use std::sync::Arc;

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware, Skip},
    rewrite::RuleSet,
};

/// Rewrites the request path before routing. The query string is kept as is.
pub struct RewriteMiddleware {
    next: Option<Skip>,
    rules: Arc<RuleSet>,
}

impl RewriteMiddleware {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { next: None, rules }
    }

    pub fn with_skip(mut self, next: Skip) -> Self {
        self.next = Some(next);
        self
    }
}

#[async_trait]
impl GatewayMiddleware for RewriteMiddleware {
    fn name(&self) -> &'static str {
        "rewrite"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if let Some(skip) = &self.next
            && skip(ctx)
        {
            return Ok(ControlFlow::Continue);
        }

        let (rewritten, matched) = self.rules.rewrite(ctx.uri.path());
        if !matched {
            return Ok(ControlFlow::Continue);
        }

        let mut path_and_query = rewritten.into_owned();
        if let Some(query) = ctx.uri.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        tracing::debug!(
            request_id = %ctx.request_id,
            from = %ctx.uri.path(),
            to = %path_and_query,
            "rewrote request path"
        );

        ctx.uri = with_path_and_query(&ctx.uri, &path_and_query)?;
        Ok(ControlFlow::Continue)
    }
}

fn with_path_and_query(uri: &Uri, path_and_query: &str) -> GatewayResult<Uri> {
    let path_and_query = PathAndQuery::try_from(path_and_query)
        .map_err(|e| GatewayError::Internal(format!("rewritten path is not a valid uri: {e}")))?;

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts)
        .map_err(|e| GatewayError::Internal(format!("rewritten path is not a valid uri: {e}")))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    use super::*;

    fn ctx(uri: &str) -> RequestContext {
        RequestContext::new(
            "req-test".into(),
            Method::GET,
            uri.parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            None,
        )
    }

    fn middleware() -> RewriteMiddleware {
        let rules = RuleSet::compile([
            ("/old", "/new"),
            ("/users/*/orders/*", "/user/$1/order/$2"),
        ])
        .unwrap();
        RewriteMiddleware::new(Arc::new(rules))
    }

    #[tokio::test]
    async fn rewrites_path_and_keeps_query() {
        let mut c = ctx("/users/123/orders/456?expand=items");
        let flow = middleware().on_request(&mut c).await.unwrap();

        assert!(matches!(flow, ControlFlow::Continue));
        assert_eq!(c.uri, "/user/123/order/456?expand=items");
        assert_eq!(c.original_url(), "/users/123/orders/456?expand=items");
    }

    #[tokio::test]
    async fn unmatched_path_is_left_alone() {
        let mut c = ctx("/not-matching-any-rule?x=1");
        middleware().on_request(&mut c).await.unwrap();
        assert_eq!(c.uri, "/not-matching-any-rule?x=1");
    }

    #[tokio::test]
    async fn absolute_uri_keeps_its_authority() {
        let mut c = ctx("http://gateway.local:8080/old");
        middleware().on_request(&mut c).await.unwrap();
        assert_eq!(c.uri, "http://gateway.local:8080/new");
    }

    #[tokio::test]
    async fn skip_predicate_bypasses_rewrite() {
        let rewrite =
            middleware().with_skip(Arc::new(|ctx: &RequestContext| ctx.method == Method::GET));

        let mut c = ctx("/old");
        rewrite.on_request(&mut c).await.unwrap();
        assert_eq!(c.uri, "/old");
    }

    #[tokio::test]
    async fn invalid_rewritten_path_is_an_error() {
        let rules = RuleSet::compile([("/bad", "/with space")]).unwrap();
        let rewrite = RewriteMiddleware::new(Arc::new(rules));

        let mut c = ctx("/bad");
        let err = rewrite.on_request(&mut c).await.err().unwrap();
        assert!(matches!(err, GatewayError::Internal(_)));
        assert_eq!(c.uri, "/bad");
    }
}
