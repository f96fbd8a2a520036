use std::sync::Arc;

use http::{Method, StatusCode};

/// Request passed to the pluggable HTTP handler. No network I/O happens in the
/// simulator; the call exists so orchestrations exercising `call_http` can be
/// tested against a canned handler.
#[derive(Debug, Clone)]
pub struct DurableHttpRequest {
    pub method: Method,
    pub uri: String,
    pub content: Option<String>,
}

impl DurableHttpRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            content: None,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct DurableHttpResponse {
    pub status_code: StatusCode,
    pub content: Option<String>,
}

impl DurableHttpResponse {
    pub fn new(status_code: StatusCode) -> Self {
        Self {
            status_code,
            content: None,
        }
    }

    /// The default response when no handler is installed.
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// Installed via `DurosimClient::set_call_http_handler`.
pub type CallHttpHandler = Arc<dyn Fn(&DurableHttpRequest) -> DurableHttpResponse + Send + Sync>;
