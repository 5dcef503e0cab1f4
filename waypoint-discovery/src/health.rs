//! Named health checks
//!
//! Node sources register a check per registry service name while the service
//! is not deployed, and remove it when they are shut down. The registry only
//! stores providers; results are computed on demand.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Health status of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Outcome of evaluating a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    /// Human-readable explanation of the status
    pub message: String,
    /// When the provider produced this result
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    #[must_use]
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: message.into(),
            checked_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: message.into(),
            checked_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

type CheckProvider = Arc<dyn Fn() -> HealthCheckResult + Send + Sync>;

/// Registry of named health checks for one component.
///
/// Clones share the same checks, so every node source can hold its own copy.
#[derive(Clone)]
pub struct HealthRegistry {
    /// Component name used in log output
    component: String,
    /// Check providers keyed by check name
    checks: Arc<DashMap<String, CheckProvider>>,
}

impl HealthRegistry {
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            checks: Arc::new(DashMap::new()),
        }
    }

    /// Register a check, replacing any previous check with the same name
    pub fn register_check<F>(&self, name: &str, provider: F)
    where
        F: Fn() -> HealthCheckResult + Send + Sync + 'static,
    {
        tracing::debug!(component = %self.component, check = %name, "Registering health check");
        self.checks.insert(name.to_string(), Arc::new(provider));
    }

    /// Remove a check; returns whether it existed
    pub fn remove_check(&self, name: &str) -> bool {
        self.checks.remove(name).is_some()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.checks.contains_key(name)
    }

    /// Evaluate a single check
    #[must_use]
    pub fn check(&self, name: &str) -> Option<HealthCheckResult> {
        // Clone the provider out so the shard lock is not held while it runs
        let provider = self.checks.get(name).map(|p| p.value().clone())?;
        Some(provider())
    }

    /// Evaluate every check, sorted by name
    #[must_use]
    pub fn results(&self) -> Vec<(String, HealthCheckResult)> {
        let providers: Vec<(String, CheckProvider)> = self
            .checks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut results: Vec<_> = providers
            .into_iter()
            .map(|(name, provider)| (name, provider()))
            .collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Aggregate status: healthy when every check is healthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.results().iter().all(|(_, r)| r.is_healthy())
    }
}

impl std::fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("component", &self.component)
            .field("checks", &self.checks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_remove() {
        let health = HealthRegistry::new("registry");
        health.register_check("orders-dev", || HealthCheckResult::healthy("not deployed"));

        assert!(health.contains("orders-dev"));
        let result = health.check("orders-dev").unwrap();
        assert!(result.is_healthy());
        assert_eq!(result.message, "not deployed");

        assert!(health.remove_check("orders-dev"));
        assert!(!health.remove_check("orders-dev"));
        assert!(health.check("orders-dev").is_none());
    }

    #[test]
    fn test_aggregate_status() {
        let health = HealthRegistry::new("registry");
        assert!(health.is_healthy());

        health.register_check("a", || HealthCheckResult::healthy("ok"));
        health.register_check("b", || HealthCheckResult::unhealthy("down"));
        assert!(!health.is_healthy());

        let names: Vec<_> = health.results().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        health.remove_check("b");
        assert!(health.is_healthy());
    }
}
