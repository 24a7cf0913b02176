//! reqwest-backed network access for the fetch interceptor and precache.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::models::{Request, Response};

use super::NetworkError;

/// Default HTTP request timeout in seconds.
/// The interceptor adds no timeout of its own, so this is the only bound.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Something that can turn a `Request` into a `Response`.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Network access over HTTP.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    /// Create a client with the default timeout
    pub fn new() -> Result<Self, NetworkError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, NetworkError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| NetworkError::Unreachable(format!("{}: {}", request.url, e)))?;

        let response = self
            .client
            .request(method, request.url.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| NetworkError::Body(e.to_string()))?;

        debug!(url = %request.url, status, bytes = body.len(), "Network fetch complete");
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_returns_status_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_string(r#"{"name":"Tiles"}"#),
            )
            .mount(&server)
            .await;

        let network = HttpNetwork::new().unwrap();
        let url = Url::parse(&format!("{}/manifest.json", server.uri())).unwrap();
        let resp = network.fetch(&Request::get(url)).await.unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("Content-Type"), Some("application/json"));
        assert_eq!(&resp.body[..], br#"{"name":"Tiles"}"#);
    }

    #[tokio::test]
    async fn test_http_error_status_is_not_a_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let network = HttpNetwork::new().unwrap();
        let url = Url::parse(&format!("{}/missing.png", server.uri())).unwrap();
        let resp = network.fetch(&Request::get(url)).await.unwrap();
        assert_eq!(resp.status, 404);
        assert!(!resp.is_ok());
    }

    #[tokio::test]
    async fn test_connection_refused_is_a_network_error() {
        // Bind then drop a listener so the port is known to be closed
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let network = HttpNetwork::with_timeout(Duration::from_secs(2)).unwrap();
        let url = Url::parse(&format!("http://127.0.0.1:{}/index.html", port)).unwrap();
        let result = network.fetch(&Request::get(url)).await;
        assert!(matches!(result, Err(NetworkError::Transport(_))));
    }
}
