//! Request forwarding to backends.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderName, Method};
use axum::response::{IntoResponse, Response};
use reqwest::Client;

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{Error, Result};

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: [HeaderName; 9] = [
    header::HOST,
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "trailers"
}

/// Copy of `headers` without hop-by-hop headers or a stale content length.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name) && *name != header::CONTENT_LENGTH)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// An inbound request, ready to be sent to a backend.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path as received, forwarded unchanged.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    fn url(&self, base: &str) -> String {
        match &self.query {
            Some(query) if !query.is_empty() => format!("{}{}?{}", base, self.path, query),
            _ => format!("{}{}", base, self.path),
        }
    }
}

pub struct RequestProxy {
    http_client: Client,
    request_timeout: Duration,
}

impl RequestProxy {
    pub fn new(request_timeout: Duration, proxy_timeout: Duration) -> std::result::Result<Self, reqwest::Error> {
        Ok(Self {
            http_client: Client::builder().timeout(proxy_timeout).build()?,
            request_timeout,
        })
    }

    pub fn from_config(config: &Config) -> std::result::Result<Self, reqwest::Error> {
        Self::new(
            Duration::from_secs(config.proxy.request_timeout_secs),
            Duration::from_secs(config.proxy.proxy_timeout_secs),
        )
    }

    /// Forward a request and relay the backend's response, whatever its status.
    pub async fn forward(&self, backend: &dyn Backend, request: ForwardRequest) -> Result<Response> {
        backend.mark_request().await;

        let url = request.url(&backend.url());
        tracing::debug!("Proxying {} {} to {}", request.method, request.path, url);

        let upstream = self
            .http_client
            .request(request.method.clone(), &url)
            .headers(forwardable_headers(&request.headers))
            .body(request.body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(backend.name(), e))?;

        let status = upstream.status();
        let headers = forwardable_headers(upstream.headers());
        let body = upstream
            .bytes()
            .await
            .map_err(|e| map_transport_error(backend.name(), e))?;

        let mut response = (status, body).into_response();
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn map_transport_error(model: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        tracing::warn!("Backend {} timed out: {}", model, err);
        Error::BackendTimeout(format!("{} did not respond in time", model))
    } else if err.is_connect() {
        tracing::warn!("Backend {} refused the connection: {}", model, err);
        Error::BackendUnavailable(format!("cannot connect to {}", model))
    } else {
        tracing::error!("Proxying to {} failed: {}", model, err);
        Error::Proxy(err.to_string())
    }
}
