//! HTTP transport abstraction and the reqwest-backed implementation.

use std::fmt;
use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};
use url::Url;

use crate::config::SessionConfig;
use crate::envelope::Envelope;
use crate::error::{Result, SessionError, classify_reqwest_error};

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate may have installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A request relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Absolute path, e.g. `/api/v1/items`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Raw response: status plus body bytes. Non-2xx statuses are not errors here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[inline]
    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Unwrap the envelope payload, mapping failures to [`SessionError::Api`].
    pub fn into_data<T: DeserializeOwned>(self) -> Result<T> {
        let envelope = serde_json::from_slice::<Envelope<T>>(&self.body);
        match envelope {
            Ok(envelope) if self.is_success() => envelope.into_data(self.status),
            Ok(envelope) => {
                let error = envelope.error.unwrap_or_default();
                Err(SessionError::Api {
                    status: self.status,
                    code: error.code,
                    message: error.message,
                })
            }
            Err(e) if self.is_success() => Err(e.into()),
            // Error pages are often not JSON at all.
            Err(_) => Err(SessionError::Api {
                status: self.status,
                code: None,
                message: None,
            }),
        }
    }
}

/// Sends one request, attaching the bearer token when given.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse>;
}

/// [`HttpTransport`] over a dedicated `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl ReqwestTransport {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        install_rustls_provider();

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .build()
            .map_err(|e| SessionError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url()?,
        })
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| SessionError::configuration(format!("invalid request path `{path}`: {e}")))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse> {
        let url = self.url_for(&request.path)?;
        let mut builder = self.client.request(request.method.into(), url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        trace!(method = %request.method, path = %request.path, status, len = body.len(), "HTTP response");
        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_success_status_maps_to_api_error() {
        let response = ApiResponse::new(
            409,
            r#"{"resultType":"ERROR","error":{"code":"DUPLICATE_EMAIL","message":"taken"}}"#,
        );
        assert_eq!(
            response.into_data::<serde_json::Value>().unwrap_err(),
            SessionError::Api {
                status: 409,
                code: Some("DUPLICATE_EMAIL".into()),
                message: Some("taken".into()),
            }
        );

        let html = ApiResponse::new(502, "<html>bad gateway</html>");
        assert!(matches!(
            html.into_data::<serde_json::Value>(),
            Err(SessionError::Api { status: 502, .. })
        ));
    }

    #[test]
    fn garbage_success_body_is_malformed() {
        let response = ApiResponse::new(200, "not json");
        assert!(matches!(
            response.into_data::<serde_json::Value>(),
            Err(SessionError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn transport_joins_paths_onto_base_url() {
        let config = SessionConfig::default().with_base_url("https://api.example.com");
        let transport = ReqwestTransport::new(&config).unwrap();
        assert_eq!(
            transport.url_for("/api/v1/items").unwrap().as_str(),
            "https://api.example.com/api/v1/items"
        );
    }

    #[test]
    fn request_builder_collects_query() {
        let request = ApiRequest::get("/api/v1/items").query("page", 2).query("size", 20);
        assert_eq!(
            request.query,
            vec![
                ("page".to_string(), "2".to_string()),
                ("size".to_string(), "20".to_string())
            ]
        );
    }
}
