//! ICE server list: public STUN servers plus optional relay credentials.
//!
//! Relay (TURN) credentials are short-lived and come from an HTTP endpoint
//! that returns a JSON array of ICE server descriptors. When that endpoint
//! fails, calls still go ahead on STUN alone and may not connect across
//! restrictive networks.

use std::time::Duration;

use async_trait::async_trait;
use dari_shared::IceServer;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay credential request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relay credential service answered {0}")]
    Status(reqwest::StatusCode),
}

#[async_trait]
pub trait RelayCredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<IceServer>, RelayError>;
}

/// Fetches relay credentials with a plain GET.
pub struct HttpRelayCredentials {
    client: reqwest::Client,
    url: String,
}

impl HttpRelayCredentials {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(url: impl Into<String>) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RelayCredentialSource for HttpRelayCredentials {
    async fn fetch(&self) -> Result<Vec<IceServer>, RelayError> {
        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(RelayError::Status(resp.status()));
        }
        let servers: Vec<IceServer> = resp.json().await?;
        debug!(count = servers.len(), "Relay credentials fetched");
        Ok(servers)
    }
}

/// STUN servers first, then whatever the relay source hands out.
pub async fn resolve_ice_servers(
    stun_urls: &[String],
    relay: Option<&dyn RelayCredentialSource>,
) -> Vec<IceServer> {
    let mut servers = Vec::new();
    if !stun_urls.is_empty() {
        servers.push(IceServer::stun(stun_urls.iter().cloned()));
    }

    if let Some(relay) = relay {
        match relay.fetch().await {
            Ok(relays) => servers.extend(relays),
            Err(e) => warn!(error = %e, "Relay credentials unavailable, continuing with STUN only"),
        }
    }
    servers
}
