use bytes::Bytes;
use http::{HeaderMap, Method, Uri, header};
use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    net::IpAddr,
    time::Instant,
};

use crate::config::RouteConfig;

/// A value stashed on the context by one middleware for later ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalValue {
    Bytes(Bytes),
    Text(String),
    /// Anything else, already rendered.
    Display(String),
}

impl LocalValue {
    pub fn display(value: impl fmt::Display) -> Self {
        Self::Display(value.to_string())
    }

    pub fn render(&self) -> Cow<'_, str> {
        match self {
            Self::Bytes(bytes) => String::from_utf8_lossy(bytes),
            Self::Text(text) | Self::Display(text) => Cow::Borrowed(text),
        }
    }
}

impl From<&str> for LocalValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for LocalValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Bytes> for LocalValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    /// The URI the client sent. Rewrites and proxying only touch `uri`.
    pub original_uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub started_at: Instant,
    pub route: Option<RouteConfig>,
    pub chosen_upstream: Option<String>,
    pub locals: HashMap<String, LocalValue>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            original_uri: uri.clone(),
            uri,
            headers,
            body,
            client_ip,
            started_at: Instant::now(),
            route: None,
            chosen_upstream: None,
            locals: HashMap::new(),
        }
    }

    /// Host requested by the client, port included.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.original_uri.authority().map(|a| a.as_str()))
    }

    /// Path and query as the client sent them.
    pub fn original_url(&self) -> &str {
        self.original_uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    pub fn set_local(&mut self, key: impl Into<String>, value: impl Into<LocalValue>) {
        self.locals.insert(key.into(), value.into());
    }

    /// Renders a local for logging; missing keys render as an empty string.
    pub fn local_text(&self, key: &str) -> Cow<'_, str> {
        self.locals
            .get(key)
            .map(LocalValue::render)
            .unwrap_or(Cow::Borrowed(""))
    }
}
