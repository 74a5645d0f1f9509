//! Discovery watch loop
//!
//! Consumes membership snapshots from the discovery backend and reconciles
//! the node table against them. Backend errors are logged and retried after
//! one health-check interval; a stream that ends cleanly ends the loop.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::Shared;

pub(crate) async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    let service = shared.service_name().to_string();
    let discovery = shared.discovery();
    let backoff = shared.probe_config().interval;

    loop {
        let watched = tokio::select! {
            () = cancel.cancelled() => return,
            watched = discovery.watch(&service, cancel.child_token()) => watched,
        };

        let mut stream = match watched {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(service = %service, error = %e, "Discovery watch failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(backoff) => continue,
                }
            }
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                next = stream.next() => match next {
                    Some(snapshot) => shared.reconcile(snapshot).await,
                    None => {
                        tracing::debug!(service = %service, "Discovery watch stream ended");
                        return;
                    }
                },
            }
        }
    }
}
