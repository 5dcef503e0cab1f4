//! Service discovery with environment fallback

pub mod endpoint;
pub mod node_monitor;
pub mod node_source;
pub mod refresh;
pub mod registry;
pub mod registry_node_source;
pub mod service_discovery;
pub mod service_list_monitor;
pub mod static_node_source;

pub use endpoint::{Endpoint, ServiceDeployment};
pub use node_monitor::NodeMonitor;
pub use node_source::{NodeSource, NodeSourceLoader, SourceKind};
pub use refresh::LoadStatus;
pub use registry::{LocalRegistry, RegistryClient, RegistryNode};
pub use registry_node_source::RegistryNodeSource;
pub use service_discovery::{
    ActiveSource, DiscoveryContext, EndpointsChanged, ServiceDiscovery, ServiceDiscoveryPool,
};
pub use service_list_monitor::{ServiceCatalog, ServiceListMonitor};
pub use static_node_source::StaticNodeSource;
