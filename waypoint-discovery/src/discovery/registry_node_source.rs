//! Registry-backed node source
//!
//! Resolves a deployment's registry service name against the shared catalog
//! and, once the name is known to exist, polls its nodes with a dedicated
//! [`NodeMonitor`].

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::endpoint::{Endpoint, ServiceDeployment};
use super::node_monitor::NodeMonitor;
use super::node_source::{NodeSource, SourceKind};
use super::registry::RegistryClient;
use super::service_list_monitor::ServiceListMonitor;
use crate::error::{Error, Result};
use crate::health::{HealthCheckResult, HealthRegistry};

/// Node source for one deployment registered in the service registry.
///
/// The node monitor is only started once the catalog lists the deployment, and
/// is stopped again when the deployment leaves the catalog.
pub struct RegistryNodeSource {
    /// Deployment this source resolves.
    deployment: ServiceDeployment,
    /// Registry service name, canonicalized to the catalog's casing once found.
    service_name: RwLock<String>,
    /// Handle on the shared catalog monitor, released on shutdown.
    catalog: RwLock<Option<Arc<ServiceListMonitor>>>,
    registry: Arc<dyn RegistryClient>,
    /// Node monitor, present while the deployment is in the catalog.
    monitor: RwLock<Option<Arc<NodeMonitor>>>,
    health: HealthRegistry,
    /// Name of the "not deployed" check currently registered, if any.
    registered_check: Mutex<Option<String>>,
    /// Polling cadence handed to the node monitor.
    reload_interval: Duration,
    /// Cancelled on shutdown; wakes any `init` still waiting on a first load.
    cancel_token: CancellationToken,
    disposed: AtomicBool,
}

impl RegistryNodeSource {
    #[must_use]
    pub fn new(
        deployment: ServiceDeployment,
        catalog: Arc<ServiceListMonitor>,
        registry: Arc<dyn RegistryClient>,
        health: HealthRegistry,
        reload_interval: Duration,
    ) -> Self {
        let service_name = deployment.registry_service_name();
        Self {
            deployment,
            service_name: RwLock::new(service_name),
            catalog: RwLock::new(Some(catalog)),
            registry,
            monitor: RwLock::new(None),
            health,
            registered_check: Mutex::new(None),
            reload_interval,
            cancel_token: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Current registry service name
    #[must_use]
    pub fn service_name(&self) -> String {
        self.service_name.read().clone()
    }

    #[must_use]
    pub fn has_monitor(&self) -> bool {
        self.monitor.read().is_some()
    }

    fn disposed_error(&self) -> Error {
        Error::Disposed(self.deployment.registry_service_name())
    }

    fn catalog(&self) -> Option<Arc<ServiceListMonitor>> {
        self.catalog.read().clone()
    }

    /// Start the node monitor if the catalog now lists the service
    fn ensure_monitor(&self, catalog: &ServiceListMonitor) -> Option<Arc<NodeMonitor>> {
        let mut monitor = self.monitor.write();
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        if let Some(existing) = monitor.as_ref() {
            return Some(existing.clone());
        }

        let requested = self.service_name.read().clone();
        let canonical = catalog.resolve(&requested)?;
        if canonical != requested {
            tracing::debug!(
                requested = %requested,
                canonical = %canonical,
                "Using registry casing for service name"
            );
            *self.service_name.write() = canonical.clone();
        }

        let started = Arc::new(NodeMonitor::start(
            self.registry.clone(),
            canonical,
            self.reload_interval,
        ));
        *monitor = Some(started.clone());
        Some(started)
    }

    fn register_undeployed_check(&self, name: &str) {
        let mut registered = self.registered_check.lock();
        if registered.is_some() {
            return;
        }

        tracing::info!(service = %name, "Service does not exist in the registry");
        let message = format!("Service '{name}' does not exist in the registry");
        self.health
            .register_check(name, move || HealthCheckResult::healthy(message.clone()));
        *registered = Some(name.to_string());
    }

    fn remove_undeployed_check(&self) {
        if let Some(name) = self.registered_check.lock().take() {
            self.health.remove_check(&name);
        }
    }
}

#[async_trait]
impl NodeSource for RegistryNodeSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Registry
    }

    fn supports_multiple_environments(&self) -> bool {
        true
    }

    async fn init(&self) -> Result<()> {
        let catalog = self.catalog().ok_or_else(|| self.disposed_error())?;

        tokio::select! {
            loaded = catalog.init() => loaded?,
            () = self.cancel_token.cancelled() => return Err(self.disposed_error()),
        }

        // A deployment that left the catalog is re-resolved from scratch when
        // it comes back, so a stale node list never outlives the removal
        if !catalog.contains(&self.service_name()) {
            let stale = self.monitor.write().take();
            if let Some(monitor) = stale {
                tracing::info!(service = %monitor.registry_service_name(), "Service removed from registry, stopping node monitor");
                monitor.shutdown();
            }
        }

        // Membership is confirmed before any node polling starts
        let Some(monitor) = self.ensure_monitor(&catalog) else {
            return Ok(());
        };
        tokio::select! {
            loaded = monitor.init() => loaded,
            () = self.cancel_token.cancelled() => Err(self.disposed_error()),
        }
    }

    fn nodes(&self) -> Arc<[Endpoint]> {
        self.monitor
            .read()
            .as_ref()
            .map_or_else(|| Arc::from(Vec::new()), |m| m.nodes())
    }

    fn was_undeployed(&self) -> bool {
        let Some(catalog) = self.catalog() else {
            return false;
        };

        let name = self.service_name();
        if catalog.contains(&name) {
            self.remove_undeployed_check();
            false
        } else {
            self.register_undeployed_check(&name);
            true
        }
    }

    fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!(service = %self.service_name(), "Shutting down registry node source");
        self.cancel_token.cancel();
        self.remove_undeployed_check();
        if let Some(monitor) = self.monitor.write().take() {
            monitor.shutdown();
        }
        // Releases this source's handle on the shared catalog monitor
        self.catalog.write().take();
    }
}

impl Drop for RegistryNodeSource {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::registry::{LocalRegistry, RegistryNode};
    use crate::discovery::service_list_monitor::ServiceCatalog;

    const FAST: Duration = Duration::from_millis(5);

    struct Fixture {
        registry: LocalRegistry,
        catalog: ServiceCatalog,
        health: HealthRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = LocalRegistry::new();
            Self {
                catalog: ServiceCatalog::new(Arc::new(registry.clone()), FAST),
                registry,
                health: HealthRegistry::new("registry"),
            }
        }

        fn source(&self, service: &str, env: &str) -> RegistryNodeSource {
            RegistryNodeSource::new(
                ServiceDeployment::new(service, env),
                self.catalog.acquire(),
                Arc::new(self.registry.clone()),
                self.health.clone(),
                FAST,
            )
        }
    }

    #[tokio::test]
    async fn test_init_resolves_case_insensitively() {
        let fixture = Fixture::new();
        fixture
            .registry
            .register("Orders-Prod", vec![RegistryNode::new("n1", "10.0.0.1")]);

        let source = fixture.source("orders", "prod");
        source.init().await.unwrap();

        assert_eq!(source.service_name(), "Orders-Prod");
        assert!(!source.was_undeployed());
        assert_eq!(source.nodes().len(), 1);
        assert!(fixture.health.results().is_empty());
    }

    #[tokio::test]
    async fn test_undeployed_registers_healthy_check() {
        let fixture = Fixture::new();
        let source = fixture.source("orders", "dev");
        source.init().await.unwrap();

        assert!(!source.has_monitor());
        assert!(source.nodes().is_empty());
        assert!(source.was_undeployed());
        assert!(source.was_undeployed());

        let check = fixture.health.check("orders-dev").unwrap();
        assert!(check.is_healthy());
        assert!(check.message.contains("does not exist"));

        source.shutdown();
        assert!(!fixture.health.contains("orders-dev"));
    }

    #[tokio::test]
    async fn test_init_again_after_deployment_appears() {
        let fixture = Fixture::new();
        let source = fixture.source("orders", "dev");
        source.init().await.unwrap();
        assert!(source.was_undeployed());

        fixture
            .registry
            .register("orders-dev", vec![RegistryNode::new("n1", "10.0.0.9")]);
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                source.init().await.unwrap();
                if source.has_monitor() {
                    break;
                }
                tokio::time::sleep(FAST).await;
            }
        })
        .await
        .unwrap();

        assert!(!source.was_undeployed());
        assert!(!fixture.health.contains("orders-dev"));
        assert_eq!(source.nodes()[0].host, "10.0.0.9");
    }

    #[tokio::test]
    async fn test_init_propagates_registry_error() {
        let fixture = Fixture::new();
        fixture.registry.register("orders-dev", Vec::new());
        fixture.registry.fail_service("orders-dev", "mock: some error");

        let source = fixture.source("orders", "dev");
        assert_eq!(
            source.init().await,
            Err(Error::Registry("mock: some error".to_string()))
        );
        assert!(!source.was_undeployed());
    }

    /// Registry whose catalog queries take longer than the tests wait.
    struct SlowCatalog;

    #[async_trait]
    impl RegistryClient for SlowCatalog {
        async fn list_services(&self) -> Result<Vec<String>> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(Vec::new())
        }

        async fn service_nodes(&self, _service_name: &str) -> Result<Vec<RegistryNode>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_shutdown_wakes_init_waiting_on_catalog() {
        let registry: Arc<dyn RegistryClient> = Arc::new(SlowCatalog);
        let catalog = ServiceCatalog::new(registry.clone(), FAST);
        let source = Arc::new(RegistryNodeSource::new(
            ServiceDeployment::new("orders", "dev"),
            catalog.acquire(),
            registry,
            HealthRegistry::new("registry"),
            FAST,
        ));
        let waiter = {
            let source = source.clone();
            tokio::spawn(async move { source.init().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        source.shutdown();

        let result = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("init still waiting after shutdown")
            .unwrap();
        assert_eq!(result, Err(Error::Disposed("orders-dev".to_string())));
        assert!(!source.has_monitor());
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let fixture = Fixture::new();
        fixture.registry.register("orders-dev", Vec::new());
        let source = fixture.source("orders", "dev");
        source.init().await.unwrap();
        assert_eq!(fixture.catalog.handle_count(), 1);

        source.shutdown();
        source.shutdown();

        assert_eq!(fixture.catalog.handle_count(), 0);
        assert!(!source.has_monitor());
        assert!(matches!(source.init().await, Err(Error::Disposed(_))));
    }
}
