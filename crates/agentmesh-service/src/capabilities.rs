//! Fetches a peer's advertised capabilities over HTTP, the production
//! implementation of `agentmesh_discovery::CapabilityFetcher`.

use agentmesh_core::error::CoreError;
use agentmesh_core::model::{NodeCapabilities, NodeRecord};
use agentmesh_discovery::CapabilityFetcher;
use async_trait::async_trait;
use reqwest::Client;

pub struct HttpCapabilityFetcher {
    http: Client,
}

impl HttpCapabilityFetcher {
    pub fn new() -> Self {
        Self { http: Client::new() }
    }
}

impl Default for HttpCapabilityFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityFetcher for HttpCapabilityFetcher {
    async fn fetch_capabilities(&self, node: &NodeRecord) -> Result<NodeCapabilities, CoreError> {
        let response = self
            .http
            .get(format!("{}/capabilities", node.base_url))
            .send()
            .await
            .map_err(|e| CoreError::TransientPeer {
                node: node.slug.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(CoreError::TransientPeer {
                node: node.slug.clone(),
                message: format!("capabilities fetch returned {}", response.status()),
            });
        }

        response.json::<NodeCapabilities>().await.map_err(|e| CoreError::TransientPeer {
            node: node.slug.clone(),
            message: e.to_string(),
        })
    }
}
