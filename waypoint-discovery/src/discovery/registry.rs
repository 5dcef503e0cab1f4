//! Registry boundary
//!
//! `RegistryClient` is the seam to the service catalog's wire protocol.
//! `LocalRegistry` is an in-process catalog for single-node deployments and
//! tests; it behaves like the remote one, including injected failures.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};

/// One health entry for a service instance, as returned by the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RegistryNode {
    /// Registry node name
    pub node: String,
    /// Node address
    pub address: String,
    /// Service-specific address; takes precedence over `address` when set
    pub service_address: String,
    pub service_port: Option<u16>,
    pub service_tags: Vec<String>,
    pub service_meta: HashMap<String, String>,
}

impl RegistryNode {
    #[must_use]
    pub fn new(node: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            address: address.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.service_port = Some(port);
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_meta
            .insert("ServiceVersion".to_string(), version.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.service_tags.push(tag.into());
        self
    }

    /// Decode a JSON array of health entries
    pub fn decode_list(json: &str) -> Result<Vec<Self>> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Client for the service registry
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Names of every registered service
    async fn list_services(&self) -> Result<Vec<String>>;

    /// Health entries of one service, by exact registry service name
    async fn service_nodes(&self, service_name: &str) -> Result<Vec<RegistryNode>>;
}

#[derive(Debug, Default)]
struct LocalState {
    services: BTreeMap<String, Vec<RegistryNode>>,
    failing_services: HashMap<String, String>,
    catalog_failure: Option<String>,
}

/// In-memory registry
#[derive(Debug, Clone, Default)]
pub struct LocalRegistry {
    state: Arc<RwLock<LocalState>>,
}

impl LocalRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing its node list
    pub fn register(&self, service_name: &str, nodes: Vec<RegistryNode>) {
        let mut state = self.state.write();
        state.services.insert(service_name.to_string(), nodes);
        tracing::debug!(service = %service_name, "Service registered in local registry");
    }

    /// Remove a service from the catalog
    pub fn deregister(&self, service_name: &str) -> bool {
        let mut state = self.state.write();
        state.failing_services.remove(service_name);
        state.services.remove(service_name).is_some()
    }

    /// Make node queries for a service fail until `recover_service`
    pub fn fail_service(&self, service_name: &str, message: &str) {
        self.state
            .write()
            .failing_services
            .insert(service_name.to_string(), message.to_string());
    }

    pub fn recover_service(&self, service_name: &str) {
        self.state.write().failing_services.remove(service_name);
    }

    /// Make catalog queries fail (`Some`) or succeed again (`None`)
    pub fn fail_catalog(&self, message: Option<&str>) {
        self.state.write().catalog_failure = message.map(str::to_string);
    }

    #[must_use]
    pub fn service_names(&self) -> HashSet<String> {
        self.state.read().services.keys().cloned().collect()
    }
}

#[async_trait]
impl RegistryClient for LocalRegistry {
    async fn list_services(&self) -> Result<Vec<String>> {
        let state = self.state.read();
        if let Some(message) = &state.catalog_failure {
            return Err(Error::Registry(message.clone()));
        }
        Ok(state.services.keys().cloned().collect())
    }

    async fn service_nodes(&self, service_name: &str) -> Result<Vec<RegistryNode>> {
        let state = self.state.read();
        if let Some(message) = state.failing_services.get(service_name) {
            return Err(Error::Registry(message.clone()));
        }
        state
            .services
            .get(service_name)
            .cloned()
            .ok_or_else(|| Error::Registry(format!("Service '{service_name}' is not registered")))
    }
}
