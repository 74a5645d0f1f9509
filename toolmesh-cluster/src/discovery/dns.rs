//! DNS-based service discovery
//!
//! Resolves SRV records for the service name first and falls back to A/AAAA
//! records combined with a configured default port. Lookups are cached for
//! `cache_ttl`; `watch` re-resolves on the same period and emits a snapshot
//! only when the set of endpoints actually changed.
//!
//! Typical names:
//! - `_grpc._tcp.tools.default.svc.cluster.local` (SRV)
//! - `tools-headless.default.svc.cluster.local` (A/AAAA, headless service)

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use hickory_resolver::TokioAsyncResolver;
use moka::future::Cache;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{ServiceDiscovery, ServiceInstance, WatchStream};
use crate::error::{Error, Result};

/// Metadata key recording how an instance was resolved ("srv" or "a").
pub const RECORD_METADATA_KEY: &str = "dns_record";

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// Name resolution used by [`DnsDiscovery`].
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>>;
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// System resolver backed by `hickory-resolver`.
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    /// Build from `/etc/resolv.conf` (or the platform equivalent).
    pub fn from_system_conf() -> Result<Self> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::Configuration(format!("Failed to load resolver config: {e}")))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl DnsResolver for HickoryResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>> {
        let lookup = self
            .inner
            .srv_lookup(name)
            .await
            .map_err(|e| Error::NotFound(format!("SRV lookup failed for '{name}': {e}")))?;
        Ok(lookup
            .iter()
            .map(|srv| SrvTarget {
                target: srv.target().to_utf8().trim_end_matches('.').to_string(),
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
            })
            .collect())
    }

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| Error::NotFound(format!("DNS lookup failed for '{host}': {e}")))?;
        Ok(lookup.iter().collect())
    }
}

struct Resolution {
    resolver: Arc<dyn DnsResolver>,
    default_port: u16,
    cache: Cache<String, Vec<ServiceInstance>>,
}

impl Resolution {
    async fn cached(&self, service_name: &str, query: &str) -> Result<Vec<ServiceInstance>> {
        if let Some(hit) = self.cache.get(service_name).await {
            return Ok(hit);
        }
        self.refresh(service_name, query).await
    }

    /// Bypass the cache, then store the result for later `discover` calls.
    async fn refresh(&self, service_name: &str, query: &str) -> Result<Vec<ServiceInstance>> {
        let fresh = self.resolve(service_name, query).await?;
        self.cache
            .insert(service_name.to_string(), fresh.clone())
            .await;
        Ok(fresh)
    }

    /// Uncached lookup: SRV first, then A/AAAA with the default port.
    async fn resolve(&self, service_name: &str, query: &str) -> Result<Vec<ServiceInstance>> {
        match self.resolver.lookup_srv(query).await {
            Ok(targets) if !targets.is_empty() => {
                return Ok(srv_instances(service_name, targets));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::trace!(
                    query = %query,
                    error = %e,
                    "SRV lookup failed, falling back to host records"
                );
            }
        }

        let ips = self.resolver.lookup_ip(query).await?;
        let mut seen = BTreeSet::new();
        let instances: Vec<ServiceInstance> = ips
            .into_iter()
            // DNS may return the same address more than once
            .filter(|ip| seen.insert(*ip))
            .map(|ip| {
                let address = ip.to_string();
                let mut instance =
                    ServiceInstance::new(String::new(), service_name, address, self.default_port)
                        .with_metadata(RECORD_METADATA_KEY, "a");
                instance.id = instance.endpoint();
                instance
            })
            .collect();

        if instances.is_empty() {
            return Err(Error::NotFound(format!("no DNS records for '{query}'")));
        }
        Ok(instances)
    }
}

fn srv_instances(service_name: &str, targets: Vec<SrvTarget>) -> Vec<ServiceInstance> {
    let mut seen = BTreeSet::new();
    targets
        .into_iter()
        .filter_map(|t| {
            let mut instance = ServiceInstance::new(String::new(), service_name, t.target, t.port)
                .with_weight(i32::from(t.weight))
                .with_metadata(RECORD_METADATA_KEY, "srv")
                .with_metadata("srv_priority", t.priority.to_string());
            instance.id = instance.endpoint();
            seen.insert(instance.id.clone()).then_some(instance)
        })
        .collect()
}

fn endpoint_set(instances: &[ServiceInstance]) -> BTreeSet<String> {
    instances.iter().map(ServiceInstance::endpoint).collect()
}

/// DNS-backed discovery. Read-only: `register`/`deregister` are unsupported.
pub struct DnsDiscovery {
    resolution: Arc<Resolution>,
    query_name: Option<String>,
    cache_ttl: Duration,
    cancel_token: CancellationToken,
}

impl DnsDiscovery {
    /// Default cache lifetime for resolved records.
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

    /// Discovery using the system resolver.
    pub fn new(default_port: u16, cache_ttl: Duration) -> Result<Self> {
        let resolver = HickoryResolver::from_system_conf()?;
        Self::with_resolver(Arc::new(resolver), default_port, cache_ttl)
    }

    /// Discovery using a caller-supplied resolver.
    pub fn with_resolver(
        resolver: Arc<dyn DnsResolver>,
        default_port: u16,
        cache_ttl: Duration,
    ) -> Result<Self> {
        if cache_ttl.is_zero() {
            return Err(Error::InvalidArgument(
                "DNS cache TTL must be greater than zero".to_string(),
            ));
        }
        let cache = Cache::builder()
            .max_capacity(1024)
            .time_to_live(cache_ttl)
            .build();
        Ok(Self {
            resolution: Arc::new(Resolution {
                resolver,
                default_port,
                cache,
            }),
            query_name: None,
            cache_ttl,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Query this DNS name regardless of the service name asked for.
    #[must_use]
    pub fn with_query_name(mut self, name: impl Into<String>) -> Self {
        self.query_name = Some(name.into());
        self
    }

    fn query_for(&self, service_name: &str) -> String {
        self.query_name
            .clone()
            .unwrap_or_else(|| service_name.to_string())
    }

    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    #[must_use]
    pub fn default_port(&self) -> u16 {
        self.resolution.default_port
    }
}

#[async_trait]
impl ServiceDiscovery for DnsDiscovery {
    async fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        self.resolution
            .cached(service_name, &self.query_for(service_name))
            .await
    }

    async fn register(&self, _instance: ServiceInstance) -> Result<()> {
        Err(Error::Unsupported(
            "DNS discovery is read-only; register is not supported".to_string(),
        ))
    }

    async fn deregister(&self, _instance_id: &str) -> Result<()> {
        Err(Error::Unsupported(
            "DNS discovery is read-only; deregister is not supported".to_string(),
        ))
    }

    async fn watch(&self, service_name: &str, cancel: CancellationToken) -> Result<WatchStream> {
        let (tx, rx) = mpsc::channel(1);
        let resolution = self.resolution.clone();
        let shutdown = self.cancel_token.clone();
        let service = service_name.to_string();
        let query = self.query_for(service_name);
        let period = self.cache_ttl;

        let mut last = resolution
            .cached(&service, &query)
            .await
            .ok()
            .map(|instances| endpoint_set(&instances));

        tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = shutdown.cancelled() => return,
                    () = tx.closed() => return,
                    _ = timer.tick() => {
                        let instances = match resolution.refresh(&service, &query).await {
                            Ok(instances) => instances,
                            Err(e) => {
                                tracing::warn!(
                                    service = %service,
                                    error = %e,
                                    "DNS watch refresh failed, keeping last snapshot"
                                );
                                continue;
                            }
                        };
                        let current = endpoint_set(&instances);
                        if last.as_ref() == Some(&current) {
                            continue;
                        }
                        if tx.try_send(instances).is_ok() {
                            tracing::debug!(
                                service = %service,
                                endpoints = current.len(),
                                "DNS membership changed"
                            );
                            last = Some(current);
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn close(&self) -> Result<()> {
        self.cancel_token.cancel();
        self.resolution.cache.invalidate_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeResolver {
        srv: Mutex<Vec<SrvTarget>>,
        ips: Mutex<Vec<IpAddr>>,
        lookups: AtomicUsize,
    }

    impl FakeResolver {
        fn with_ips(ips: &[&str]) -> Arc<Self> {
            let resolver = Self::default();
            resolver.set_ips(ips);
            Arc::new(resolver)
        }

        fn set_ips(&self, ips: &[&str]) {
            *self.ips.lock() = ips.iter().map(|ip| ip.parse().unwrap()).collect();
        }

        fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DnsResolver for FakeResolver {
        async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvTarget>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let srv = self.srv.lock().clone();
            if srv.is_empty() {
                Err(Error::NotFound(format!("no SRV for {name}")))
            } else {
                Ok(srv)
            }
        }

        async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
            let ips = self.ips.lock().clone();
            if ips.is_empty() {
                Err(Error::NotFound(format!("no A records for {host}")))
            } else {
                Ok(ips)
            }
        }
    }

    #[tokio::test]
    async fn test_srv_records_take_precedence() {
        let resolver = FakeResolver::with_ips(&["10.0.0.1"]);
        *resolver.srv.lock() = vec![
            SrvTarget {
                target: "tools-0.tools.default.svc".to_string(),
                port: 7001,
                priority: 10,
                weight: 5,
            },
            SrvTarget {
                target: "tools-1.tools.default.svc".to_string(),
                port: 7001,
                priority: 10,
                weight: 0,
            },
        ];
        let disc = DnsDiscovery::with_resolver(resolver, 50051, Duration::from_secs(30)).unwrap();

        let found = disc.discover("_grpc._tcp.tools").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].endpoint(), "tools-0.tools.default.svc:7001");
        assert_eq!(found[0].weight, 5);
        assert_eq!(found[1].effective_weight(), 1);
        assert_eq!(
            found[0].metadata.get(RECORD_METADATA_KEY).map(String::as_str),
            Some("srv")
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_host_records_with_default_port() {
        let resolver = FakeResolver::with_ips(&["10.0.0.1", "10.0.0.2", "10.0.0.1", "::1"]);
        let disc = DnsDiscovery::with_resolver(resolver, 50051, Duration::from_secs(30)).unwrap();

        let found = disc.discover("tools-headless").await.unwrap();
        let endpoints: Vec<_> = found.iter().map(ServiceInstance::endpoint).collect();
        assert_eq!(endpoints, vec!["10.0.0.1:50051", "10.0.0.2:50051", "[::1]:50051"]);
        assert!(found.iter().all(|i| i.id == i.endpoint()));
        assert!(found.iter().all(|i| i.name == "tools-headless"));
    }

    #[tokio::test]
    async fn test_unresolvable_name_is_not_found() {
        let disc = DnsDiscovery::with_resolver(
            Arc::new(FakeResolver::default()),
            50051,
            Duration::from_secs(30),
        )
        .unwrap();
        assert!(matches!(
            disc.discover("nowhere").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_ttl() {
        let resolver = FakeResolver::with_ips(&["10.0.0.1"]);
        let disc =
            DnsDiscovery::with_resolver(resolver.clone(), 50051, Duration::from_millis(100)).unwrap();

        disc.discover("tools").await.unwrap();
        assert_eq!(resolver.lookups(), 1);

        // Served from cache before the TTL elapses.
        resolver.set_ips(&["10.0.0.2"]);
        let cached = disc.discover("tools").await.unwrap();
        assert_eq!(resolver.lookups(), 1);
        assert_eq!(cached[0].address, "10.0.0.1");

        tokio::time::sleep(Duration::from_millis(150)).await;

        let fresh = disc.discover("tools").await.unwrap();
        assert_eq!(resolver.lookups(), 2);
        assert_eq!(fresh[0].address, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_query_name_override() {
        let resolver = FakeResolver::with_ips(&["10.0.0.7"]);
        let disc = DnsDiscovery::with_resolver(resolver, 9000, Duration::from_secs(30))
            .unwrap()
            .with_query_name("tools-headless.default.svc");
        let found = disc.discover("tools").await.unwrap();
        assert_eq!(found[0].name, "tools");
        assert_eq!(found[0].endpoint(), "10.0.0.7:9000");
    }

    #[tokio::test]
    async fn test_register_is_unsupported() {
        let disc = DnsDiscovery::with_resolver(
            FakeResolver::with_ips(&["10.0.0.1"]),
            50051,
            Duration::from_secs(30),
        )
        .unwrap();
        assert!(matches!(
            disc.register(ServiceInstance::new("a", "tools", "10.0.0.1", 1)).await,
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            disc.deregister("a").await,
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let result = DnsDiscovery::with_resolver(
            Arc::new(FakeResolver::default()),
            50051,
            Duration::ZERO,
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_watch_resolves_every_ttl_period() {
        let resolver = FakeResolver::with_ips(&["10.0.0.1"]);
        let disc =
            DnsDiscovery::with_resolver(resolver.clone(), 50051, Duration::from_millis(100)).unwrap();
        let cancel = CancellationToken::new();
        let _stream = disc.watch("tools", cancel.clone()).await.unwrap();
        assert_eq!(resolver.lookups(), 1);

        tokio::time::sleep(Duration::from_millis(1050)).await;
        cancel.cancel();

        // One lookup per tick (ten ticks) plus the initial one.
        let lookups = resolver.lookups();
        assert!(lookups >= 9, "lookups={lookups}");
    }

    #[tokio::test]
    async fn test_watch_emits_only_on_change() {
        let resolver = FakeResolver::with_ips(&["10.0.0.1", "10.0.0.2"]);
        let disc =
            DnsDiscovery::with_resolver(resolver.clone(), 50051, Duration::from_millis(50)).unwrap();
        let cancel = CancellationToken::new();
        let mut stream = disc.watch("tools", cancel.clone()).await.unwrap();

        // Same records, reordered: no emission.
        resolver.set_ips(&["10.0.0.2", "10.0.0.1"]);
        let quiet = tokio::time::timeout(Duration::from_millis(250), stream.next()).await;
        assert!(quiet.is_err());

        resolver.set_ips(&["10.0.0.1", "10.0.0.3"]);
        let snapshot = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        let endpoints = endpoint_set(&snapshot);
        assert!(endpoints.contains("10.0.0.3:50051"));
        assert!(!endpoints.contains("10.0.0.2:50051"));

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
