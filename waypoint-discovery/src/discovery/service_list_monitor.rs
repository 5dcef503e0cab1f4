//! Service catalog monitoring
//!
//! Tracks the set of service names currently registered. One monitor is shared
//! by every registry-backed node source through [`ServiceCatalog`]; its refresh
//! loop stops when the last handle is released.

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::refresh::{retry_backoff, wait_until_loaded, with_registry_timeout, LoadStatus, MAX_RETRY_DELAY};
use super::registry::RegistryClient;
use crate::error::{Error, Result};

/// State shared between the monitor and its refresh task.
struct CatalogState {
    /// Registered service names, in the registry's casing.
    services: RwLock<Arc<HashSet<String>>>,
    /// Load state that `init` waits on.
    status: watch::Sender<LoadStatus>,
}

impl CatalogState {
    /// Settle a monitor that stopped before its first load.
    fn stop(&self) {
        LoadStatus::fail(&self.status, Error::Disposed("service catalog".to_string()));
    }

    fn apply(&self, names: Vec<String>) {
        let next: HashSet<String> = names.into_iter().collect();
        let changed = {
            let current = self.services.read();
            **current != next
        };

        if changed {
            let mut current = self.services.write();
            let added = next.difference(&current).count();
            let removed = current.difference(&next).count();
            *current = Arc::new(next);
            tracing::info!(
                service_count = current.len(),
                added,
                removed,
                "Service catalog changed"
            );
        }

        LoadStatus::ready(&self.status);
    }
}

/// Monitor of the registry's service catalog.
///
/// Answers membership questions from an in-memory snapshot that a background
/// task refreshes on the catalog reload interval.
pub struct ServiceListMonitor {
    /// Catalog snapshot and load state, shared with the refresh task
    state: Arc<CatalogState>,
    /// Cancellation token for the background refresh loop
    cancel_token: CancellationToken,
}

impl ServiceListMonitor {
    /// Start polling the catalog in the background
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn start(registry: Arc<dyn RegistryClient>, reload_interval: Duration) -> Self {
        let (status, _) = watch::channel(LoadStatus::Loading);
        let state = Arc::new(CatalogState {
            services: RwLock::new(Arc::new(HashSet::new())),
            status,
        });
        let cancel_token = CancellationToken::new();

        Self::spawn_refresh_loop(state.clone(), registry, reload_interval, cancel_token.clone());

        Self {
            state,
            cancel_token,
        }
    }

    fn spawn_refresh_loop(
        state: Arc<CatalogState>,
        registry: Arc<dyn RegistryClient>,
        reload_interval: Duration,
        cancel_token: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut backoff = None;

            loop {
                let fetch = with_registry_timeout("catalog query", registry.list_services());
                let delay = tokio::select! {
                    () = cancel_token.cancelled() => break,
                    result = fetch => match result {
                        Ok(names) => {
                            state.apply(names);
                            backoff = None;
                            reload_interval
                        }
                        Err(e) => {
                            let delay = backoff
                                .get_or_insert_with(|| retry_backoff(reload_interval))
                                .next()
                                .unwrap_or(MAX_RETRY_DELAY);
                            tracing::warn!(
                                error = %e,
                                retry_in = ?delay,
                                "Service catalog refresh failed, keeping last known services"
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

            state.stop();
            tracing::debug!("Service catalog refresh loop stopped");
        });
    }

    /// Complete once the first catalog load finished
    ///
    /// Fails with the registry error only while no load has ever succeeded.
    pub async fn init(&self) -> Result<()> {
        wait_until_loaded(&self.state.status).await
    }

    /// Current set of registered service names
    #[must_use]
    pub fn services(&self) -> Arc<HashSet<String>> {
        self.state.services.read().clone()
    }

    /// Exact-casing membership
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.state.services.read().contains(name)
    }

    /// Case-insensitive lookup returning the catalog's casing
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<String> {
        let services = self.services();
        if services.contains(name) {
            return Some(name.to_string());
        }
        services
            .iter()
            .find(|s| s.eq_ignore_ascii_case(name))
            .cloned()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for ServiceListMonitor {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.state.stop();
    }
}

/// Process-wide owner of the shared catalog monitor
///
/// Hands out reference-counted handles; the monitor starts on the first
/// `acquire` and stops when the last handle is dropped.
pub struct ServiceCatalog {
    /// Registry the monitor polls
    registry: Arc<dyn RegistryClient>,
    /// Polling cadence of the monitor
    reload_interval: Duration,
    /// Running monitor, if any handle is still alive
    current: Mutex<Weak<ServiceListMonitor>>,
}

impl ServiceCatalog {
    #[must_use]
    pub fn new(registry: Arc<dyn RegistryClient>, reload_interval: Duration) -> Self {
        Self {
            registry,
            reload_interval,
            current: Mutex::new(Weak::new()),
        }
    }

    /// Get a handle to the shared monitor, starting it if needed
    #[must_use]
    pub fn acquire(&self) -> Arc<ServiceListMonitor> {
        let mut current = self.current.lock();
        if let Some(monitor) = current.upgrade() {
            return monitor;
        }

        tracing::debug!(reload_interval = ?self.reload_interval, "Starting service catalog monitor");
        let monitor = Arc::new(ServiceListMonitor::start(
            self.registry.clone(),
            self.reload_interval,
        ));
        *current = Arc::downgrade(&monitor);
        monitor
    }

    /// Number of live handles
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.current.lock().strong_count()
    }
}
