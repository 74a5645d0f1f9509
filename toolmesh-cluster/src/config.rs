//! Serializable cluster settings
//!
//! Loaded by the binary through the `config` crate; durations are humantime
//! strings ("5s", "250ms").

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::LoadBalancingStrategy;
use crate::discovery::{
    DnsDiscovery, KubernetesDiscovery, RegistryDiscovery, ServiceDiscovery, ServiceInstance,
    StaticDiscovery,
};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub service_name: String,
    pub strategy: LoadBalancingStrategy,
    #[serde(with = "humantime_duration")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_duration")]
    pub health_check_timeout: Duration,
    pub max_failures: u32,
    pub retry_attempts: u32,
    #[serde(with = "humantime_duration")]
    pub retry_delay: Duration,
    /// Per-attempt bound on a forwarded call.
    #[serde(with = "humantime_duration")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub connect_timeout: Duration,
    pub tls: TlsSettings,
    pub discovery: DiscoverySettings,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            strategy: LoadBalancingStrategy::RoundRobin,
            health_check_interval: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(3),
            max_failures: 3,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            tls: TlsSettings::default(),
            discovery: DiscoverySettings::default(),
        }
    }
}

/// Client-side TLS material and verification mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    /// Client certificate chain (PEM), for mutual TLS.
    pub cert_file: Option<PathBuf>,
    /// Client private key (PEM), for mutual TLS.
    pub key_file: Option<PathBuf>,
    /// CA bundle (PEM). Falls back to the Mozilla root set.
    pub ca_file: Option<PathBuf>,
    /// Overrides the name checked against the server certificate.
    pub server_name: Option<String>,
    /// Skip peer verification. Refused in production.
    pub insecure_skip_verify: bool,
}

/// Which discovery backend to build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoverySettings {
    Static {
        #[serde(default)]
        instances: Vec<ServiceInstance>,
    },
    Dns {
        /// DNS name to query; defaults to the service name.
        #[serde(default)]
        name: Option<String>,
        #[serde(default = "default_dns_port")]
        default_port: u16,
        #[serde(default = "default_dns_ttl", with = "humantime_duration")]
        cache_ttl: Duration,
    },
    Kubernetes {
        /// Defaults to `POD_NAMESPACE`.
        #[serde(default)]
        namespace: Option<String>,
    },
    Registry {
        address: String,
        #[serde(default)]
        token: Option<String>,
    },
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self::Static {
            instances: Vec::new(),
        }
    }
}

const fn default_dns_port() -> u16 {
    50051
}

const fn default_dns_ttl() -> Duration {
    DnsDiscovery::DEFAULT_CACHE_TTL
}

impl DiscoverySettings {
    /// Construct the configured backend.
    pub fn build(&self) -> Result<Arc<dyn ServiceDiscovery>> {
        let discovery: Arc<dyn ServiceDiscovery> = match self {
            Self::Static { instances } => Arc::new(StaticDiscovery::new(instances.clone())),
            Self::Dns {
                name,
                default_port,
                cache_ttl,
            } => {
                let mut dns = DnsDiscovery::new(*default_port, *cache_ttl)?;
                if let Some(name) = name {
                    dns = dns.with_query_name(name.clone());
                }
                Arc::new(dns)
            }
            Self::Kubernetes { namespace } => match namespace {
                Some(ns) => Arc::new(KubernetesDiscovery::new(ns.clone())),
                None => Arc::new(KubernetesDiscovery::from_env()?),
            },
            Self::Registry { address, token } => {
                Arc::new(RegistryDiscovery::new(address.clone(), token.clone())?)
            }
        };
        Ok(discovery)
    }
}

/// `Duration` as a humantime string.
pub mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<humantime::Duration>()
            .map(Duration::from)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration '{raw}': {e}")))
    }
}
