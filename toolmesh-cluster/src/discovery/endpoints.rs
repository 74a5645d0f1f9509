//! Push-driven endpoint set shared by the orchestrator and registry adapters
//!
//! Holds the last known membership per service and fans snapshots out to
//! watchers. Delivery is best-effort: each watcher has a buffer of one, and
//! a snapshot that finds the buffer full is dropped rather than queued.

use std::collections::HashMap;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{healthy_only, ServiceInstance, WatchStream};
use crate::error::{Error, Result};

struct Subscriber {
    service: String,
    tx: mpsc::Sender<Vec<ServiceInstance>>,
}

/// Membership table plus watcher fan-out.
#[derive(Default)]
pub struct EndpointSet {
    services: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EndpointSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discover(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        self.services
            .read()
            .get(service_name)
            .map(|entries| healthy_only(entries))
            .ok_or_else(|| Error::NotFound(format!("service {service_name}")))
    }

    /// Insert or replace an instance, keyed by id within its service.
    pub fn register(&self, instance: ServiceInstance) -> Result<()> {
        instance.validate()?;
        let service = instance.name.clone();
        let snapshot = {
            let mut services = self.services.write();
            let entries = services.entry(service.clone()).or_default();
            match entries.iter_mut().find(|i| i.id == instance.id) {
                Some(slot) => *slot = instance,
                None => entries.push(instance),
            }
            entries.clone()
        };
        self.notify(&service, &snapshot);
        Ok(())
    }

    pub fn deregister(&self, instance_id: &str) -> Result<()> {
        let (service, snapshot) = {
            let mut services = self.services.write();
            let mut found = None;
            for (service, entries) in services.iter_mut() {
                if let Some(pos) = entries.iter().position(|i| i.id == instance_id) {
                    entries.remove(pos);
                    found = Some((service.clone(), entries.clone()));
                    break;
                }
            }
            found.ok_or_else(|| Error::NotFound(format!("instance {instance_id}")))?
        };
        self.notify(&service, &snapshot);
        Ok(())
    }

    /// Replace the whole membership of a service and notify watchers.
    pub fn replace(&self, service_name: &str, instances: Vec<ServiceInstance>) {
        let snapshot: Vec<ServiceInstance> = instances
            .into_iter()
            .map(|mut i| {
                if i.name.is_empty() {
                    i.name = service_name.to_string();
                }
                i
            })
            .collect();
        self.services
            .write()
            .insert(service_name.to_string(), snapshot.clone());
        self.notify(service_name, &snapshot);
    }

    pub fn watch(&self, service_name: &str, cancel: CancellationToken) -> WatchStream {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.lock().push(Subscriber {
            service: service_name.to_string(),
            tx,
        });
        ReceiverStream::new(rx)
            .take_until(cancel.cancelled_owned())
            .boxed()
    }

    /// Drop every watcher; their streams end.
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }

    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn notify(&self, service_name: &str, snapshot: &[ServiceInstance]) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            if sub.service != service_name {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(snapshot.to_vec()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(
                        service = %service_name,
                        "Watcher busy, dropping membership snapshot"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance::new(id, "tools", format!("10.0.0.{}", id.len()), 50051)
    }

    #[tokio::test]
    async fn test_watch_receives_snapshots() {
        let set = EndpointSet::new();
        let mut stream = set.watch("tools", CancellationToken::new());

        set.register(instance("a")).unwrap();
        let snapshot = stream.next().await.unwrap();
        assert_eq!(snapshot.len(), 1);

        set.register(instance("bb")).unwrap();
        let snapshot = stream.next().await.unwrap();
        assert_eq!(snapshot.len(), 2);

        set.deregister("a").unwrap();
        let snapshot = stream.next().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "bb");
    }

    #[tokio::test]
    async fn test_busy_watcher_drops_newer_snapshots() {
        let set = EndpointSet::new();
        let mut stream = set.watch("tools", CancellationToken::new());

        set.replace("tools", vec![instance("a")]);
        set.replace("tools", vec![instance("a"), instance("bb")]);

        // Only the first snapshot fit in the buffer.
        let first = stream.next().await.unwrap();
        assert_eq!(first.len(), 1);

        set.replace("tools", vec![instance("ccc")]);
        let next = stream.next().await.unwrap();
        assert_eq!(next[0].id, "ccc");
    }

    #[tokio::test]
    async fn test_watchers_only_see_their_service() {
        let set = EndpointSet::new();
        let mut stream = set.watch("other", CancellationToken::new());

        set.register(instance("a")).unwrap();
        set.replace("other", vec![ServiceInstance::new("x", "", "10.1.0.1", 1)]);

        let snapshot = stream.next().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "x");
        assert_eq!(snapshot[0].name, "other");
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let set = EndpointSet::new();
        let cancel = CancellationToken::new();
        let mut stream = set.watch("tools", cancel.clone());
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_ends_streams_and_prunes() {
        let set = EndpointSet::new();
        let mut stream = set.watch("tools", CancellationToken::new());
        assert_eq!(set.watcher_count(), 1);

        set.close();
        assert_eq!(set.watcher_count(), 0);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_watchers_are_pruned() {
        let set = EndpointSet::new();
        let stream = set.watch("tools", CancellationToken::new());
        drop(stream);

        set.register(instance("a")).unwrap();
        assert_eq!(set.watcher_count(), 0);
    }

    #[test]
    fn test_discover_filters_unhealthy() {
        let set = EndpointSet::new();
        set.replace(
            "tools",
            vec![instance("a"), instance("bb").with_healthy(false)],
        );
        let found = set.discover("tools").unwrap();
        assert_eq!(found.len(), 1);
        assert!(matches!(set.discover("nope"), Err(Error::NotFound(_))));
    }
}
