use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bridge_proto::{ProxyRequest, ProxyResponse};
use reqwest::{Client, Method};
use tracing::debug;
use url::Url;

use crate::error::TransportError;

/// Route for proxy requests while the guest channel is not attached.
#[async_trait]
pub trait DirectPath: Send + Sync {
    async fn forward(&self, request: &ProxyRequest) -> Result<ProxyResponse, TransportError>;
}

/// Forwards proxy requests over HTTP to a host-reachable base URL.
pub struct HttpDirectPath {
    client: Client,
    base: Url,
}

impl HttpDirectPath {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }
}

#[async_trait]
impl DirectPath for HttpDirectPath {
    async fn forward(&self, request: &ProxyRequest) -> Result<ProxyResponse, TransportError> {
        let url = self
            .base
            .join(request.path.trim_start_matches('/'))
            .map_err(|e| {
                TransportError::InvalidRequest(format!("proxy path '{}': {e}", request.path))
            })?;
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TransportError::InvalidRequest(format!("method '{}'", request.method)))?;

        debug!(%url, %method, "forwarding over direct path");

        let mut req = self.client.request(method, url);
        for (name, value) in &request.headers {
            req = req.header(name, value);
        }
        if let Some(body) = &request.body {
            req = req.body(body.clone());
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = resp.text().await?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    #[tokio::test]
    async fn forwards_method_path_and_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/rest/v1/items")
                    .header("x-project", "p1")
                    .body("{\"a\":1}");
                then.status(201).header("x-id", "9").body("created");
            })
            .await;

        let base = Url::parse(&server.base_url()).unwrap();
        let direct = HttpDirectPath::new(base, Duration::from_secs(5)).unwrap();
        let mut headers = BTreeMap::new();
        headers.insert("x-project".to_string(), "p1".to_string());

        let resp = direct
            .forward(&ProxyRequest {
                method: "POST".to_string(),
                path: "/rest/v1/items".to_string(),
                headers,
                body: Some("{\"a\":1}".to_string()),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, "created");
        assert_eq!(resp.headers.get("x-id").map(String::as_str), Some("9"));
    }

    #[tokio::test]
    async fn invalid_method_is_rejected() {
        let base = Url::parse("http://127.0.0.1:9/").unwrap();
        let direct = HttpDirectPath::new(base, Duration::from_secs(1)).unwrap();
        let err = direct
            .forward(&ProxyRequest {
                method: "BAD METHOD".to_string(),
                path: "/".to_string(),
                headers: BTreeMap::new(),
                body: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
    }
}
