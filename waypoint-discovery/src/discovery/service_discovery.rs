//! Environment-fallback service discovery
//!
//! `ServiceDiscovery` is the per-service object callers resolve endpoints
//! through. It owns a node source for the originating environment and one for
//! the master environment, and decides which of them serves traffic:
//!
//! - the originating deployment whenever it is registered;
//! - the master deployment when the originating one is not registered and
//!   fallback is enabled, the process is not itself in master, and the source
//!   supports environments at all;
//! - an `EnvironmentNotFound` error when neither resolves.
//!
//! Registry errors on a registered deployment never trigger fallback.
//! Re-evaluation runs on every refresh tick and configuration change; a change
//! notification goes out whenever the effective endpoint set, the serving
//! environment or the node source implementation changes.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::endpoint::{same_endpoints, Endpoint, ServiceDeployment};
use super::node_source::{NodeSource, NodeSourceLoader, SourceKind};
use super::registry::RegistryClient;
use super::service_list_monitor::ServiceCatalog;
use crate::config::{DiscoveryConfig, LiveConfig};
use crate::error::{Error, Result};
use crate::health::HealthRegistry;

const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Shared dependencies of every `ServiceDiscovery` in a process.
pub struct DiscoveryContext {
    /// Live discovery settings; every new snapshot triggers a re-evaluation
    config: LiveConfig,
    /// Builds node sources and owns the shared catalog
    loader: NodeSourceLoader,
}

impl DiscoveryContext {
    /// Create a context; the catalog monitor polls at the configured
    /// `catalog_reload_interval`.
    #[must_use]
    pub fn new(config: LiveConfig, registry: Arc<dyn RegistryClient>, health: HealthRegistry) -> Self {
        let catalog_interval = config.current().catalog_reload_interval;
        let catalog = Arc::new(ServiceCatalog::new(registry.clone(), catalog_interval));
        Self {
            config,
            loader: NodeSourceLoader::new(registry, catalog, health),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &LiveConfig {
        &self.config
    }

    #[must_use]
    pub const fn loader(&self) -> &NodeSourceLoader {
        &self.loader
    }

    #[must_use]
    pub const fn health(&self) -> &HealthRegistry {
        self.loader.health()
    }

    #[must_use]
    pub const fn catalog(&self) -> &Arc<ServiceCatalog> {
        self.loader.catalog()
    }
}

/// Environment currently serving a service's endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveSource {
    Originating,
    Master,
}

/// Signal that the effective endpoints of a service changed.
///
/// Carries no endpoints; subscribers re-read them from the discovery object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointsChanged {
    pub service_name: String,
}

/// Endpoints served by a successful evaluation.
#[derive(Debug, Clone)]
struct Resolved {
    /// Environment the endpoints came from
    active: ActiveSource,
    /// Sorted, so round-robin order is stable across refreshes
    endpoints: Arc<[Endpoint]>,
}

impl Resolved {
    fn new(active: ActiveSource, endpoints: &[Endpoint]) -> Self {
        let mut sorted = endpoints.to_vec();
        sorted.sort();
        Self {
            active,
            endpoints: Arc::from(sorted),
        }
    }
}

/// Outcome of one policy evaluation
#[derive(Debug, Clone)]
struct Resolution {
    /// Node source generation the outcome was computed from
    generation: u64,
    outcome: Result<Resolved>,
}

impl Resolution {
    /// Unresolved outcomes are a single state whatever the error or generation
    fn is_same_as(&self, other: &Self) -> bool {
        match (&self.outcome, &other.outcome) {
            (Ok(a), Ok(b)) => {
                self.generation == other.generation
                    && a.active == b.active
                    && same_endpoints(&a.endpoints, &b.endpoints)
            }
            (Err(_), Err(_)) => true,
            _ => false,
        }
    }
}

/// Identity of the node source implementation; any difference rebuilds the
/// sources and starts a new generation
#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceKey {
    /// Configured node source implementation
    kind: SourceKind,
    /// Static host list, only meaningful for `SourceKind::Config`
    hosts: Option<String>,
    /// Originating environment
    deployment_environment: String,
    /// Fallback environment
    master_environment: String,
}

impl SourceKey {
    fn from_config(service_name: &str, config: &DiscoveryConfig) -> Self {
        let service = config.service_or_default(service_name);
        Self {
            kind: service.source,
            hosts: service.hosts,
            deployment_environment: config.deployment_environment.clone(),
            master_environment: config.master_environment.clone(),
        }
    }
}

/// Node sources built for one `SourceKey`.
struct SourceSet {
    /// Configuration the sources were built from
    key: SourceKey,
    /// Source for the originating deployment
    originating: Arc<dyn NodeSource>,
    /// Absent when the process runs in master or the source is static
    master: Option<Arc<dyn NodeSource>>,
}

impl SourceSet {
    fn shutdown(&self) {
        self.originating.shutdown();
        if let Some(master) = &self.master {
            master.shutdown();
        }
    }
}

/// Discovery of one logical service across the originating and master
/// environments.
///
/// A background task re-evaluates the fallback policy on every reload tick and
/// on every configuration change. Callers read the last outcome.
pub struct ServiceDiscovery {
    /// Logical service name (e.g., "orders")
    service_name: String,
    /// Shared configuration, catalog and health registry
    context: Arc<DiscoveryContext>,
    /// Current node sources; `None` until the first evaluation or after shutdown
    sources: Mutex<Option<SourceSet>>,
    /// Bumped whenever the node sources are rebuilt
    generation: AtomicU64,
    /// Last evaluation outcome, read without waiting on I/O
    state: RwLock<Option<Arc<Resolution>>>,
    /// Serializes re-evaluation; readers use `state`
    reevaluation: tokio::sync::Mutex<()>,
    /// Round-robin position over the effective endpoints
    cursor: AtomicUsize,
    /// Change notifications for subscribers
    changes: broadcast::Sender<EndpointsChanged>,
    /// Cancellation token for the background refresh loop
    cancel_token: CancellationToken,
    disposed: AtomicBool,
}

impl ServiceDiscovery {
    /// Create the discovery object and start its refresh loop.
    ///
    /// Prefer [`ServiceDiscoveryPool::get_or_create`], which keeps one
    /// instance per service name. Must be called within a Tokio runtime.
    #[must_use]
    pub fn start(service_name: impl Into<String>, context: Arc<DiscoveryContext>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let discovery = Arc::new(Self {
            service_name: service_name.into(),
            context,
            sources: Mutex::new(None),
            generation: AtomicU64::new(0),
            state: RwLock::new(None),
            reevaluation: tokio::sync::Mutex::new(()),
            cursor: AtomicUsize::new(0),
            changes,
            cancel_token: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });

        Self::spawn_refresh_loop(Arc::downgrade(&discovery), discovery.cancel_token.clone());
        discovery
    }

    fn spawn_refresh_loop(this: Weak<Self>, cancel_token: CancellationToken) {
        let Some(mut config_rx) = this.upgrade().map(|d| d.context.config.subscribe()) else {
            return;
        };

        tokio::spawn(async move {
            loop {
                let interval = {
                    let Some(discovery) = this.upgrade() else { break };
                    discovery.reevaluate().await;
                    discovery
                        .context
                        .config
                        .current()
                        .reload_interval(&discovery.service_name)
                };

                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    changed = config_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        tracing::debug!("Configuration changed, re-evaluating discovery");
                    }
                    () = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Subscribe to change notifications. Drop the receiver to unsubscribe.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointsChanged> {
        self.changes.subscribe()
    }

    /// Environment serving the last successful resolution
    #[must_use]
    pub fn active_source(&self) -> Option<ActiveSource> {
        self.snapshot()
            .and_then(|r| r.outcome.as_ref().ok().map(|resolved| resolved.active))
    }

    /// Pick the next endpoint in round-robin order.
    ///
    /// Fails with `NoEndpointsAvailable` when the service resolved to an empty
    /// set, and with the evaluation error when it did not resolve.
    pub async fn get_next_host(&self) -> Result<Endpoint> {
        self.ensure_active()?;
        let resolution = self.current_resolution().await;
        let resolved = resolution.outcome.as_ref().map_err(|e| e.clone())?;

        if resolved.endpoints.is_empty() {
            return Err(Error::NoEndpointsAvailable(self.service_name.clone()));
        }

        let index = self.cursor.fetch_add(1, Ordering::AcqRel) % resolved.endpoints.len();
        Ok(resolved.endpoints[index].clone())
    }

    /// Return all effective endpoints once any evaluation in flight finished.
    pub async fn get_all_endpoints(&self) -> Result<Arc<[Endpoint]>> {
        self.ensure_active()?;
        let resolution = match self.snapshot() {
            Some(resolution) if resolution.outcome.is_ok() => {
                let _in_flight = self.reevaluation.lock().await;
                self.snapshot().unwrap_or(resolution)
            }
            _ => self.reevaluate().await,
        };

        resolution
            .outcome
            .as_ref()
            .map(|resolved| resolved.endpoints.clone())
            .map_err(|e| e.clone())
    }

    /// Stop the refresh loop and release both node sources; safe to call more
    /// than once
    pub fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!(service = %self.service_name, "Shutting down service discovery");
        self.cancel_token.cancel();
        if let Some(sources) = self.sources.lock().take() {
            sources.shutdown();
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed(self.service_name.clone()));
        }
        Ok(())
    }

    fn snapshot(&self) -> Option<Arc<Resolution>> {
        self.state.read().clone()
    }

    /// Last successful resolution, or a fresh evaluation when there is none
    async fn current_resolution(&self) -> Arc<Resolution> {
        match self.snapshot() {
            Some(resolution) if resolution.outcome.is_ok() => resolution,
            _ => self.reevaluate().await,
        }
    }

    async fn reevaluate(&self) -> Arc<Resolution> {
        let _writer = self.reevaluation.lock().await;

        if self.disposed.load(Ordering::Acquire) {
            return Arc::new(Resolution {
                generation: self.generation.load(Ordering::Acquire),
                outcome: Err(Error::Disposed(self.service_name.clone())),
            });
        }

        let config = self.context.config.current();
        let next = match self.refresh_sources(&config) {
            Ok((originating, master)) => Resolution {
                generation: self.generation.load(Ordering::Acquire),
                outcome: self.resolve(&config, originating, master).await,
            },
            Err(e) => Resolution {
                generation: self.generation.load(Ordering::Acquire),
                outcome: Err(e),
            },
        };

        self.publish(next)
    }

    /// Rebuild the node sources when their configured identity changed
    fn refresh_sources(
        &self,
        config: &DiscoveryConfig,
    ) -> Result<(Arc<dyn NodeSource>, Option<Arc<dyn NodeSource>>)> {
        let key = SourceKey::from_config(&self.service_name, config);
        let mut sources = self.sources.lock();

        // `shutdown` marks disposal before taking the sources
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed(self.service_name.clone()));
        }

        if let Some(current) = sources.as_ref() {
            if current.key == key {
                return Ok((current.originating.clone(), current.master.clone()));
            }
        }

        // The old sources release their monitors and health checks before
        // their replacements are built
        if let Some(previous) = sources.take() {
            tracing::info!(
                service = %self.service_name,
                from = %previous.key.kind,
                to = %key.kind,
                "Node source configuration changed, rebuilding"
            );
            previous.shutdown();
        }
        self.generation.fetch_add(1, Ordering::AcqRel);

        let service_config = config.service_or_default(&self.service_name);
        let reload_interval = config.reload_interval(&self.service_name);
        let loader = &self.context.loader;

        let originating = loader.load(
            ServiceDeployment::new(&self.service_name, &key.deployment_environment),
            &service_config,
            reload_interval,
        )?;

        let master = if config.is_master_environment() || !originating.supports_multiple_environments() {
            None
        } else {
            match loader.load(
                ServiceDeployment::new(&self.service_name, &key.master_environment),
                &service_config,
                reload_interval,
            ) {
                Ok(master) => Some(master),
                Err(e) => {
                    originating.shutdown();
                    return Err(e);
                }
            }
        };

        *sources = Some(SourceSet {
            key,
            originating: originating.clone(),
            master: master.clone(),
        });
        Ok((originating, master))
    }

    /// Apply the fallback policy to the current sources
    async fn resolve(
        &self,
        config: &DiscoveryConfig,
        originating: Arc<dyn NodeSource>,
        master: Option<Arc<dyn NodeSource>>,
    ) -> Result<Resolved> {
        // A registry error on a registered deployment surfaces here and is
        // never answered with master's endpoints
        originating.init().await?;

        if !originating.was_undeployed() {
            return Ok(Resolved::new(ActiveSource::Originating, &originating.nodes()));
        }

        let fallback_allowed = config.environment_fallback_enabled
            && !config.is_master_environment()
            && originating.supports_multiple_environments();

        let master = match master {
            Some(master) if fallback_allowed => master,
            _ => {
                return Err(Error::EnvironmentNotFound {
                    service: self.service_name.clone(),
                    environments: config.deployment_environment.clone(),
                })
            }
        };

        master.init().await?;
        if master.was_undeployed() {
            return Err(Error::EnvironmentNotFound {
                service: self.service_name.clone(),
                environments: format!(
                    "{}, {}",
                    config.deployment_environment, config.master_environment
                ),
            });
        }

        Ok(Resolved::new(ActiveSource::Master, &master.nodes()))
    }

    /// Install an evaluation outcome and notify subscribers on a transition
    fn publish(&self, next: Resolution) -> Arc<Resolution> {
        let (current, changed) = {
            let mut state = self.state.write();
            match state.as_ref() {
                // The first settle is not a transition
                None => {
                    let current = Arc::new(next);
                    *state = Some(current.clone());
                    (current, false)
                }
                Some(previous) if previous.is_same_as(&next) => {
                    if next.outcome.is_err() {
                        // Keep the freshest error for callers
                        let current = Arc::new(next);
                        *state = Some(current.clone());
                        (current, false)
                    } else {
                        (previous.clone(), false)
                    }
                }
                Some(_) => {
                    let current = Arc::new(next);
                    *state = Some(current.clone());
                    (current, true)
                }
            }
        };

        if changed && !self.disposed.load(Ordering::Acquire) {
            match &current.outcome {
                Ok(resolved) => tracing::info!(
                    service = %self.service_name,
                    active = ?resolved.active,
                    endpoint_count = resolved.endpoints.len(),
                    "Effective endpoints changed"
                ),
                Err(e) => tracing::warn!(
                    service = %self.service_name,
                    error = %e,
                    "Service became unresolvable"
                ),
            }
            // No receivers is not an error
            let _ = self.changes.send(EndpointsChanged {
                service_name: self.service_name.clone(),
            });
        }

        current
    }
}

impl Drop for ServiceDiscovery {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One `ServiceDiscovery` per service name.
///
/// Instances are created on first use and live until removed or until the
/// pool is shut down.
pub struct ServiceDiscoveryPool {
    /// Context handed to every instance
    context: Arc<DiscoveryContext>,
    /// Instances keyed by logical service name
    instances: DashMap<String, Arc<ServiceDiscovery>>,
}

impl ServiceDiscoveryPool {
    #[must_use]
    pub fn new(context: Arc<DiscoveryContext>) -> Self {
        Self {
            context,
            instances: DashMap::new(),
        }
    }

    /// Return the instance for `service_name`, starting one if needed.
    #[must_use]
    pub fn get_or_create(&self, service_name: &str) -> Arc<ServiceDiscovery> {
        self.instances
            .entry(service_name.to_string())
            .or_insert_with(|| ServiceDiscovery::start(service_name, self.context.clone()))
            .clone()
    }

    #[must_use]
    pub fn get(&self, service_name: &str) -> Option<Arc<ServiceDiscovery>> {
        self.instances.get(service_name).map(|d| d.value().clone())
    }

    /// Remove and shut down the instance for `service_name`.
    pub fn remove(&self, service_name: &str) -> bool {
        match self.instances.remove(service_name) {
            Some((_, discovery)) => {
                discovery.shutdown();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    #[must_use]
    pub const fn context(&self) -> &Arc<DiscoveryContext> {
        &self.context
    }

    pub fn shutdown(&self) {
        for entry in self.instances.iter() {
            entry.value().shutdown();
        }
        self.instances.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolution(generation: u64, active: ActiveSource, hosts: &[&str]) -> Resolution {
        let endpoints: Vec<_> = hosts.iter().map(|h| Endpoint::new(*h)).collect();
        Resolution {
            generation,
            outcome: Ok(Resolved::new(active, &endpoints)),
        }
    }

    #[test]
    fn test_resolution_identity() {
        let a = resolution(1, ActiveSource::Originating, &["a", "b"]);
        let reordered = resolution(1, ActiveSource::Originating, &["b", "a"]);
        let other_source = resolution(1, ActiveSource::Master, &["a", "b"]);
        let other_generation = resolution(2, ActiveSource::Originating, &["a", "b"]);

        assert!(a.is_same_as(&reordered));
        assert!(!a.is_same_as(&other_source));
        assert!(!a.is_same_as(&other_generation));
    }

    #[test]
    fn test_unresolved_outcomes_are_one_state() {
        let first = Resolution {
            generation: 1,
            outcome: Err(Error::Registry("a".to_string())),
        };
        let second = Resolution {
            generation: 2,
            outcome: Err(Error::EnvironmentNotFound {
                service: "orders".to_string(),
                environments: "dev".to_string(),
            }),
        };
        let resolved = resolution(1, ActiveSource::Originating, &["a"]);

        assert!(first.is_same_as(&second));
        assert!(!first.is_same_as(&resolved));
    }

    #[test]
    fn test_resolved_endpoints_are_sorted() {
        let resolved = Resolved::new(
            ActiveSource::Originating,
            &[Endpoint::new("c"), Endpoint::new("a"), Endpoint::new("b")],
        );
        let hosts: Vec<_> = resolved.endpoints.iter().map(|e| e.host.as_str()).collect();
        assert_eq!(hosts, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_source_key_tracks_implementation() {
        let mut config = DiscoveryConfig::default();
        let registry_key = SourceKey::from_config("orders", &config);

        config.services.insert(
            "orders".to_string(),
            crate::config::ServiceConfig {
                reload_interval: Some(std::time::Duration::from_millis(1)),
                ..Default::default()
            },
        );
        assert_eq!(SourceKey::from_config("orders", &config), registry_key);

        config.services.insert(
            "orders".to_string(),
            crate::config::ServiceConfig {
                source: SourceKind::Config,
                hosts: Some("localhost".to_string()),
                ..Default::default()
            },
        );
        assert_ne!(SourceKey::from_config("orders", &config), registry_key);
    }
}
