//! Node list monitoring for one registry service name
//!
//! Polls the registry in the background and keeps the decoded endpoint list
//! in a snapshot that readers take without waiting on I/O.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::endpoint::{same_endpoints, Endpoint};
use super::refresh::{retry_backoff, wait_until_loaded, with_registry_timeout, LoadStatus, MAX_RETRY_DELAY};
use super::registry::{RegistryClient, RegistryNode};
use crate::error::{Error, Result};

/// Meta key carrying the service version
const VERSION_META_KEY: &str = "ServiceVersion";

/// Tag prefix carrying the service version when no meta key is set
const VERSION_TAG_PREFIX: &str = "version:";

/// State shared between a monitor and its refresh task.
struct NodeState {
    /// Last successfully fetched node list, empty until the first fetch.
    nodes: RwLock<Arc<[Endpoint]>>,
    /// Load state that `init` waits on; settles to `Failed(Disposed)` when the
    /// loop stops before the first fetch.
    status: watch::Sender<LoadStatus>,
}

impl NodeState {
    /// Release waiters of a monitor that will never load.
    fn stop(&self, service: &str) {
        LoadStatus::fail(&self.status, Error::Disposed(service.to_string()));
    }
}

/// Monitor of the live nodes of one registry service.
///
/// Polls the registry on its reload interval and keeps serving the last good
/// node list while the registry is failing.
pub struct NodeMonitor {
    /// Exact registry service name being polled (e.g., "orders-prod")
    registry_service_name: String,
    /// Node snapshot and load state, shared with the refresh task
    state: Arc<NodeState>,
    /// Cancellation token for the background refresh loop
    cancel_token: CancellationToken,
}

impl NodeMonitor {
    /// Start polling `registry_service_name` in the background
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn start(
        registry: Arc<dyn RegistryClient>,
        registry_service_name: String,
        reload_interval: Duration,
    ) -> Self {
        let (status, _) = watch::channel(LoadStatus::Loading);
        let state = Arc::new(NodeState {
            nodes: RwLock::new(Arc::from(Vec::new())),
            status,
        });
        let cancel_token = CancellationToken::new();

        tracing::debug!(
            service = %registry_service_name,
            reload_interval = ?reload_interval,
            "Starting node monitor"
        );

        Self::spawn_refresh_loop(
            state.clone(),
            registry,
            registry_service_name.clone(),
            reload_interval,
            cancel_token.clone(),
        );

        Self {
            registry_service_name,
            state,
            cancel_token,
        }
    }

    fn spawn_refresh_loop(
        state: Arc<NodeState>,
        registry: Arc<dyn RegistryClient>,
        service: String,
        reload_interval: Duration,
        cancel_token: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut backoff = None;

            loop {
                let fetch = with_registry_timeout("node query", registry.service_nodes(&service));
                let delay = tokio::select! {
                    () = cancel_token.cancelled() => break,
                    result = fetch => match result {
                        Ok(entries) => {
                            let nodes = decode_nodes(&service, entries);
                            let changed = !same_endpoints(&state.nodes.read(), &nodes);
                            if changed {
                                tracing::info!(
                                    service = %service,
                                    node_count = nodes.len(),
                                    "Node list changed"
                                );
                                *state.nodes.write() = Arc::from(nodes);
                            }
                            LoadStatus::ready(&state.status);
                            backoff = None;
                            reload_interval
                        }
                        Err(e) => {
                            let delay = backoff
                                .get_or_insert_with(|| retry_backoff(reload_interval))
                                .next()
                                .unwrap_or(MAX_RETRY_DELAY);
                            tracing::warn!(
                                service = %service,
                                error = %e,
                                retry_in = ?delay,
                                "Node refresh failed, keeping last known nodes"
                            );
                            LoadStatus::fail(&state.status, e);
                            delay
                        }
                    },
                };

                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }

            state.stop(&service);
            tracing::debug!(service = %service, "Node monitor stopped");
        });
    }

    /// Complete once the initial node list was fetched
    ///
    /// Fails with the registry error only while no fetch has ever succeeded.
    pub async fn init(&self) -> Result<()> {
        wait_until_loaded(&self.state.status).await
    }

    /// Last known nodes; empty until the first successful fetch
    #[must_use]
    pub fn nodes(&self) -> Arc<[Endpoint]> {
        self.state.nodes.read().clone()
    }

    #[must_use]
    pub fn registry_service_name(&self) -> &str {
        &self.registry_service_name
    }

    /// Stop the refresh loop; safe to call more than once
    pub fn shutdown(&self) {
        if !self.cancel_token.is_cancelled() {
            tracing::debug!(service = %self.registry_service_name, "Shutting down node monitor");
            self.cancel_token.cancel();
        }
        self.state.stop(&self.registry_service_name);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for NodeMonitor {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.state.stop(&self.registry_service_name);
    }
}

/// Decode registry entries into endpoints, dropping entries without a host
fn decode_nodes(service: &str, entries: Vec<RegistryNode>) -> Vec<Endpoint> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let host = if entry.service_address.is_empty() {
                entry.address
            } else {
                entry.service_address
            };
            if host.is_empty() {
                tracing::warn!(service = %service, node = %entry.node, "Skipping registry entry without address");
                return None;
            }

            let version = entry.service_meta.get(VERSION_META_KEY).cloned().or_else(|| {
                entry
                    .service_tags
                    .iter()
                    .find_map(|tag| tag.strip_prefix(VERSION_TAG_PREFIX).map(str::to_string))
            });

            let mut endpoint = Endpoint::new(host);
            endpoint.port = entry.service_port;
            endpoint.version = version;
            endpoint.metadata = entry
                .service_meta
                .into_iter()
                .filter(|(key, _)| key != VERSION_META_KEY)
                .collect();
            Some(endpoint)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::registry::{LocalRegistry, MockRegistryClient};
    use crate::error::Error;

    const FAST: Duration = Duration::from_millis(5);

    #[test]
    fn test_decode_prefers_service_address() {
        let mut entry = RegistryNode::new("node-1", "10.0.0.1").with_port(8080);
        entry.service_address = "10.1.0.1".to_string();

        let nodes = decode_nodes("orders-prod", vec![entry]);
        assert_eq!(nodes, vec![Endpoint::new("10.1.0.1").with_port(8080)]);
    }

    #[test]
    fn test_decode_version_sources() {
        let from_meta = RegistryNode::new("a", "host-a")
            .with_version("2.0.0")
            .with_tag("version:1.0.0");
        let from_tag = RegistryNode::new("b", "host-b").with_tag("version:1.5.0");
        let missing_host = RegistryNode::new("c", "");

        let nodes = decode_nodes("orders-prod", vec![from_meta, from_tag, missing_host]);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].version.as_deref(), Some("2.0.0"));
        assert!(nodes[0].metadata.is_empty());
        assert_eq!(nodes[1].version.as_deref(), Some("1.5.0"));
    }

    #[tokio::test]
    async fn test_init_fetches_nodes() {
        let registry = LocalRegistry::new();
        registry.register(
            "orders-prod",
            vec![RegistryNode::new("n1", "10.0.0.1").with_port(80)],
        );

        let monitor = NodeMonitor::start(Arc::new(registry), "orders-prod".to_string(), FAST);
        monitor.init().await.unwrap();

        assert_eq!(monitor.nodes().len(), 1);
        assert_eq!(monitor.nodes()[0].address(), "10.0.0.1:80");
        assert_eq!(monitor.registry_service_name(), "orders-prod");
    }

    #[tokio::test]
    async fn test_init_fails_when_first_fetch_fails() {
        let mut mock = MockRegistryClient::new();
        mock.expect_service_nodes()
            .withf(|name| name == "orders-prod")
            .returning(|_| Err(Error::Registry("503".to_string())));

        let monitor = NodeMonitor::start(Arc::new(mock), "orders-prod".to_string(), FAST);
        assert_eq!(monitor.init().await, Err(Error::Registry("503".to_string())));
        assert!(monitor.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_serves_last_known_nodes_on_error() {
        let registry = LocalRegistry::new();
        registry.register("orders-prod", vec![RegistryNode::new("n1", "10.0.0.1")]);

        let monitor = NodeMonitor::start(Arc::new(registry.clone()), "orders-prod".to_string(), FAST);
        monitor.init().await.unwrap();

        registry.fail_service("orders-prod", "timeout");
        tokio::time::sleep(FAST * 10).await;

        assert!(monitor.init().await.is_ok());
        assert_eq!(monitor.nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_new_nodes() {
        let registry = LocalRegistry::new();
        registry.register("orders-prod", vec![RegistryNode::new("n1", "10.0.0.1")]);

        let monitor = NodeMonitor::start(Arc::new(registry.clone()), "orders-prod".to_string(), FAST);
        monitor.init().await.unwrap();

        registry.register(
            "orders-prod",
            vec![RegistryNode::new("n1", "10.0.0.1"), RegistryNode::new("n2", "10.0.0.2")],
        );

        tokio::time::timeout(Duration::from_secs(2), async {
            while monitor.nodes().len() != 2 {
                tokio::time::sleep(FAST).await;
            }
        })
        .await
        .unwrap();
    }

    /// Registry whose node queries take longer than the tests wait.
    struct SlowRegistry;

    #[async_trait::async_trait]
    impl RegistryClient for SlowRegistry {
        async fn list_services(&self) -> Result<Vec<String>> {
            Ok(vec!["orders-prod".to_string()])
        }

        async fn service_nodes(&self, _service_name: &str) -> Result<Vec<RegistryNode>> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_first_fetch_releases_init() {
        let monitor = Arc::new(NodeMonitor::start(
            Arc::new(SlowRegistry),
            "orders-prod".to_string(),
            FAST,
        ));
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.init().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.shutdown();

        let result = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("init still waiting after shutdown")
            .unwrap();
        assert_eq!(result, Err(Error::Disposed("orders-prod".to_string())));
        assert_eq!(
            monitor.init().await,
            Err(Error::Disposed("orders-prod".to_string()))
        );
    }

    #[tokio::test]
    async fn test_shutdown_keeps_loaded_nodes() {
        let registry = LocalRegistry::new();
        registry.register("orders-prod", vec![RegistryNode::new("n1", "10.0.0.1")]);

        let monitor = NodeMonitor::start(Arc::new(registry), "orders-prod".to_string(), FAST);
        monitor.init().await.unwrap();
        monitor.shutdown();

        assert!(monitor.init().await.is_ok());
        assert_eq!(monitor.nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let monitor = NodeMonitor::start(
            Arc::new(LocalRegistry::new()),
            "orders-prod".to_string(),
            FAST,
        );
        monitor.shutdown();
        monitor.shutdown();
        assert!(monitor.is_stopped());
    }
}
