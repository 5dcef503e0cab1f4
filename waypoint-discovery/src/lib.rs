pub mod config;
pub mod discovery;
pub mod error;
pub mod health;

pub use config::{Config, DiscoveryConfig, LiveConfig, ServiceConfig};
pub use discovery::{
    ActiveSource, DiscoveryContext, Endpoint, EndpointsChanged, LocalRegistry, RegistryClient,
    RegistryNode, ServiceDiscovery, ServiceDiscoveryPool, SourceKind,
};
pub use error::{Error, Result};
pub use health::{HealthCheckResult, HealthRegistry, HealthStatus};
