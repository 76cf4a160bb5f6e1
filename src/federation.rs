//! Federation contracts for anycast routing.
//!
//! The federation driver knows which peer primarily hosts an account; the
//! peer proxy forwards a request there. Discovery itself is deployment
//! infrastructure; this module carries the contracts, an HTTP proxy
//! implementation, and a static table used by tests and small setups.

use std::collections::HashMap;

use axum::body::Body;
use axum::http::{HeaderMap, Method};
use axum::response::Response;

use crate::error::{Error, Result};

pub const FORWARDED_BY_HEADER: &str = "x-keppel-forwarded-by";

#[async_trait::async_trait]
pub trait FederationDriver: Send + Sync {
    /// The hostname of the peer that primarily hosts this account, or
    /// `None` when no peer claims it.
    async fn find_primary_account(&self, account_name: &str) -> Result<Option<String>>;
}

/// Account-to-peer table fixed at startup.
pub struct StaticFederation {
    primaries: HashMap<String, String>,
}

impl StaticFederation {
    pub fn new(primaries: HashMap<String, String>) -> Self {
        Self { primaries }
    }

    pub fn empty() -> Self {
        Self {
            primaries: HashMap::new(),
        }
    }
}

#[async_trait::async_trait]
impl FederationDriver for StaticFederation {
    async fn find_primary_account(&self, account_name: &str) -> Result<Option<String>> {
        Ok(self.primaries.get(account_name).cloned())
    }
}

#[async_trait::async_trait]
pub trait PeerProxy: Send + Sync {
    /// Replays the request against the peer and returns its response.
    /// The implementation stamps `X-Keppel-Forwarded-By` so the peer can
    /// detect and refuse forwarding loops.
    async fn reverse_proxy(
        &self,
        peer_hostname: &str,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
    ) -> Result<Response>;
}

pub struct HttpPeerProxy {
    client: reqwest::Client,
    own_hostname: String,
}

impl HttpPeerProxy {
    pub fn new(own_hostname: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            own_hostname,
        }
    }
}

#[async_trait::async_trait]
impl PeerProxy for HttpPeerProxy {
    async fn reverse_proxy(
        &self,
        peer_hostname: &str,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
    ) -> Result<Response> {
        let url = format!("https://{peer_hostname}{path_and_query}");
        let mut request = self.client.request(
            reqwest::Method::from_bytes(method.as_str().as_bytes())
                .map_err(|e| Error::Internal(anyhow::anyhow!("invalid method: {e}")))?,
            &url,
        );
        for (name, value) in headers.iter() {
            if name == &axum::http::header::HOST {
                continue;
            }
            if let Ok(value) = value.to_str() {
                request = request.header(name.as_str(), value);
            }
        }
        request = request.header(FORWARDED_BY_HEADER, &self.own_hostname);

        let upstream = request.send().await?;

        let mut builder = Response::builder().status(upstream.status().as_u16());
        for (name, value) in upstream.headers().iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        let body = Body::from_stream(upstream.bytes_stream());
        builder
            .body(body)
            .map_err(|e| Error::Internal(anyhow::anyhow!("building proxied response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_federation_lookup() {
        let federation = StaticFederation::new(HashMap::from([(
            "elsewhere".to_string(),
            "registry-two.example.org".to_string(),
        )]));
        assert_eq!(
            federation.find_primary_account("elsewhere").await.unwrap(),
            Some("registry-two.example.org".to_string())
        );
        assert_eq!(federation.find_primary_account("nowhere").await.unwrap(), None);
    }
}
