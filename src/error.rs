use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::proxy::TransportError;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Body written when an upstream redirect chain exhausts its budget.
pub const TOO_MANY_REDIRECTS: &str = "too many redirects detected when doing the request";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("timeout")]
    Timeout,
    #[error("{0}")]
    Transport(String),
    #[error("{0}")]
    BufferOverflow(String),
    #[error("too many redirects detected when doing the request")]
    TooManyRedirects,
    #[error("hook failed: {0}")]
    Hook(String),
    #[error("no route matched the request")]
    RouteNotFound,
    #[error("request body exceeds configured limit")]
    PayloadTooLarge,
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Timeout => "timeout",
            Self::Transport(_) => "transport_error",
            Self::BufferOverflow(_) => "buffer_overflow",
            Self::TooManyRedirects => "too_many_redirects",
            Self::Hook(_) => "hook_error",
            Self::RouteNotFound => "route_not_found",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Proxy outcomes are written as bare text so clients see the same bodies
    /// an upstream-facing handler would produce.
    fn is_plain(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Transport(_) | Self::BufferOverflow(_) | Self::TooManyRedirects
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        if self.is_plain() {
            let mut response = (status, self.to_string()).into_response();
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            return response;
        }

        let mut response = (status, Json(ErrorBody {
            error: self.code(),
            message: self.to_string(),
        }))
            .into_response();

        if !response.headers().contains_key(header::CONTENT_TYPE) {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        response
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<TransportError> for GatewayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout,
            TransportError::BufferOverflow(msg) => Self::BufferOverflow(msg),
            other => Self::Transport(other.to_string()),
        }
    }
}
