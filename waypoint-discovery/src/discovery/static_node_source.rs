//! Statically-configured node source

use async_trait::async_trait;
use std::sync::Arc;

use super::endpoint::{Endpoint, ServiceDeployment};
use super::node_source::{NodeSource, SourceKind};
use crate::error::Result;

/// Fixed endpoint list parsed from a configured host list.
#[derive(Debug)]
pub struct StaticNodeSource {
    /// Parsed hosts, in configuration order.
    nodes: Arc<[Endpoint]>,
}

impl StaticNodeSource {
    /// Parse `hosts` (comma-separated `host[:port]`)
    pub fn new(deployment: &ServiceDeployment, hosts: &str) -> Result<Self> {
        let nodes = Endpoint::parse_list(hosts)?;
        if nodes.is_empty() {
            tracing::warn!(service = %deployment.service_name, "No hosts configured for service");
        }
        Ok(Self {
            nodes: Arc::from(nodes),
        })
    }
}

#[async_trait]
impl NodeSource for StaticNodeSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Config
    }

    fn supports_multiple_environments(&self) -> bool {
        false
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    fn nodes(&self) -> Arc<[Endpoint]> {
        self.nodes.clone()
    }

    fn was_undeployed(&self) -> bool {
        false
    }

    fn shutdown(&self) {}
}
