//! Node sources
//!
//! A node source binds one service deployment to a live endpoint list. The
//! coordinator picks the implementation per service from configuration and
//! builds it through [`NodeSourceLoader`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::endpoint::{Endpoint, ServiceDeployment};
use super::registry::RegistryClient;
use super::registry_node_source::RegistryNodeSource;
use super::service_list_monitor::ServiceCatalog;
use super::static_node_source::StaticNodeSource;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::health::HealthRegistry;

/// Node source implementation selected for a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// Live node list from the service registry
    #[default]
    #[serde(alias = "registry", alias = "Consul", alias = "consul")]
    Registry,
    /// Fixed host list from configuration
    #[serde(alias = "config")]
    Config,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry => write!(f, "Registry"),
            Self::Config => write!(f, "Config"),
        }
    }
}

/// Producer of the endpoint list for one service deployment
#[async_trait]
pub trait NodeSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Whether environment fallback applies to this source
    fn supports_multiple_environments(&self) -> bool;

    /// Resolve the deployment; safe to call again to pick up a deployment
    /// that appeared since the last call
    async fn init(&self) -> Result<()>;

    /// Current endpoints, empty when unknown
    fn nodes(&self) -> Arc<[Endpoint]>;

    /// True while the deployment is absent from the registry
    fn was_undeployed(&self) -> bool;

    /// Release monitors and health checks; safe to call more than once
    fn shutdown(&self);
}

/// Builds node sources from per-service configuration
pub struct NodeSourceLoader {
    /// Registry handed to registry-backed sources
    registry: Arc<dyn RegistryClient>,
    /// Shared catalog monitor owner
    catalog: Arc<ServiceCatalog>,
    /// Registry for "not deployed" checks
    health: HealthRegistry,
}

impl NodeSourceLoader {
    #[must_use]
    pub const fn new(
        registry: Arc<dyn RegistryClient>,
        catalog: Arc<ServiceCatalog>,
        health: HealthRegistry,
    ) -> Self {
        Self {
            registry,
            catalog,
            health,
        }
    }

    /// Build the node source configured for `deployment`
    pub fn load(
        &self,
        deployment: ServiceDeployment,
        config: &ServiceConfig,
        reload_interval: Duration,
    ) -> Result<Arc<dyn NodeSource>> {
        if let Some(scope) = config.scope.as_deref() {
            if !scope.eq_ignore_ascii_case("environment") {
                tracing::warn!(
                    service = %deployment.service_name,
                    scope = %scope,
                    "Unsupported discovery scope, using environment scope"
                );
            }
        }

        let source: Arc<dyn NodeSource> = match config.source {
            SourceKind::Registry => Arc::new(RegistryNodeSource::new(
                deployment,
                self.catalog.acquire(),
                self.registry.clone(),
                self.health.clone(),
                reload_interval,
            )),
            SourceKind::Config => Arc::new(StaticNodeSource::new(
                &deployment,
                config.hosts.as_deref().unwrap_or_default(),
            )?),
        };
        Ok(source)
    }

    #[must_use]
    pub const fn catalog(&self) -> &Arc<ServiceCatalog> {
        &self.catalog
    }

    #[must_use]
    pub const fn health(&self) -> &HealthRegistry {
        &self.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::registry::LocalRegistry;
    use crate::error::Error;

    fn loader() -> NodeSourceLoader {
        let registry: Arc<dyn RegistryClient> = Arc::new(LocalRegistry::new());
        NodeSourceLoader::new(
            registry.clone(),
            Arc::new(ServiceCatalog::new(registry, Duration::from_millis(5))),
            HealthRegistry::new("registry"),
        )
    }

    #[test]
    fn test_source_kind_aliases() {
        let kind: SourceKind = serde_json::from_str("\"config\"").unwrap();
        assert_eq!(kind, SourceKind::Config);
        let kind: SourceKind = serde_json::from_str("\"Consul\"").unwrap();
        assert_eq!(kind, SourceKind::Registry);
        assert_eq!(SourceKind::default(), SourceKind::Registry);
    }

    #[tokio::test]
    async fn test_load_selects_variant() {
        let loader = loader();
        let deployment = ServiceDeployment::new("orders", "dev");

        let registry_source = loader
            .load(deployment.clone(), &ServiceConfig::default(), Duration::from_millis(5))
            .unwrap();
        assert_eq!(registry_source.kind(), SourceKind::Registry);
        assert!(registry_source.supports_multiple_environments());
        assert_eq!(loader.catalog().handle_count(), 1);

        let config = ServiceConfig {
            source: SourceKind::Config,
            hosts: Some("localhost:8080".to_string()),
            ..ServiceConfig::default()
        };
        let static_source = loader
            .load(deployment, &config, Duration::from_millis(5))
            .unwrap();
        assert_eq!(static_source.kind(), SourceKind::Config);
        assert!(!static_source.supports_multiple_environments());

        registry_source.shutdown();
        assert_eq!(loader.catalog().handle_count(), 0);
    }

    #[tokio::test]
    async fn test_load_rejects_bad_hosts() {
        let config = ServiceConfig {
            source: SourceKind::Config,
            hosts: Some("localhost:notaport".to_string()),
            ..ServiceConfig::default()
        };
        let result = loader().load(
            ServiceDeployment::new("orders", "dev"),
            &config,
            Duration::from_millis(5),
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
