use async_trait::async_trait;

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
};

#[derive(Default)]
pub struct RequestLoggingMiddleware {
    /// Context locals appended to the completion line.
    locals: Vec<String>,
}

impl RequestLoggingMiddleware {
    pub fn new(locals: Vec<String>) -> Self {
        Self { locals }
    }

    fn render_locals(&self, ctx: &RequestContext) -> String {
        self.locals
            .iter()
            .map(|key| format!("{key}={}", ctx.local_text(key)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl GatewayMiddleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            client_ip = ?ctx.client_ip,
            "incoming request"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut axum::response::Response,
    ) -> GatewayResult<()> {
        let latency_ms = ctx.started_at.elapsed().as_millis();
        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            url = %ctx.original_url(),
            path = %ctx.uri.path(),
            status = %response.status(),
            upstream = ?ctx.chosen_upstream,
            latency_ms = latency_ms,
            locals = %self.render_locals(ctx),
            "request completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    use super::*;
    use crate::context::LocalValue;

    #[test]
    fn configured_locals_render_in_order() {
        let mut ctx = RequestContext::new(
            "req-1".into(),
            Method::GET,
            "/".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            None,
        );
        ctx.set_local("user", "alice");
        ctx.set_local("attempt", LocalValue::display(2));

        let logging = RequestLoggingMiddleware::new(vec![
            "user".into(),
            "attempt".into(),
            "missing".into(),
        ]);
        assert_eq!(logging.render_locals(&ctx), "user=alice attempt=2 missing=");
    }
}
