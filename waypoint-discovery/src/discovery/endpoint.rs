//! Endpoint types for service discovery

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Error, Result};

/// A resolvable network location of one service instance.
///
/// Structural equality; ordering is by host, then port, then version, which
/// gives round-robin selection a stable order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Hostname or IP address, without IPv6 brackets
    pub host: String,
    /// Service port, when the registry or configuration gives one
    pub port: Option<u16>,
    /// Service version advertised by the instance
    pub version: Option<String>,
    /// Extra registry metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Endpoint {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            version: None,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `host:port`, or just `host` when no port is known
    #[must_use]
    pub fn address(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// Parse a single `host[:port]` entry
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(Error::Configuration("Empty host entry".to_string()));
        }

        // Bracketed IPv6 ("[::1]:8080") or bare host/IPv4 ("host:8080")
        let (host, port) = if let Some(rest) = entry.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                Error::Configuration(format!("Unterminated IPv6 address in '{entry}'"))
            })?;
            let port = match tail {
                "" => None,
                _ => Some(tail.strip_prefix(':').ok_or_else(|| {
                    Error::Configuration(format!("Unexpected text after IPv6 address in '{entry}'"))
                })?),
            };
            (host, port)
        } else if entry.matches(':').count() == 1 {
            let (host, port) = entry.split_once(':').unwrap_or((entry, ""));
            (host, Some(port))
        } else {
            (entry, None)
        };

        let mut endpoint = Self::new(host);
        if let Some(port) = port {
            let port = port.parse::<u16>().map_err(|_| {
                Error::Configuration(format!("Invalid port '{port}' in host entry '{entry}'"))
            })?;
            endpoint = endpoint.with_port(port);
        }
        Ok(endpoint)
    }

    /// Parse a comma-separated host list; blank entries are ignored
    pub fn parse_list(hosts: &str) -> Result<Vec<Self>> {
        hosts
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(Self::parse)
            .collect()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())?;
        if let Some(version) = &self.version {
            write!(f, " (v{version})")?;
        }
        Ok(())
    }
}

/// Order-independent comparison of two endpoint lists
#[must_use]
pub fn same_endpoints(a: &[Endpoint], b: &[Endpoint]) -> bool {
    let a: BTreeSet<&Endpoint> = a.iter().collect();
    let b: BTreeSet<&Endpoint> = b.iter().collect();
    a == b
}

/// A logical service deployed under one environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceDeployment {
    /// Logical service name (e.g., "orders")
    pub service_name: String,
    /// Environment the deployment runs under (e.g., "dev")
    pub deployment_environment: String,
}

impl ServiceDeployment {
    #[must_use]
    pub fn new(service_name: impl Into<String>, deployment_environment: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            deployment_environment: deployment_environment.into(),
        }
    }

    /// Name this deployment is registered under, `{service}-{environment}`.
    #[must_use]
    pub fn registry_service_name(&self) -> String {
        format!("{}-{}", self.service_name, self.deployment_environment)
    }
}

impl fmt::Display for ServiceDeployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.registry_service_name())
    }
}
