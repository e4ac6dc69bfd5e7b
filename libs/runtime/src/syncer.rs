//! Syncer (`spec.md §4.6`, component C6): periodically re-enqueues every
//! known PR, so a reconciler can catch drift even with no informer events.

use std::sync::Arc;

use kube::ResourceExt;

use crate::assembler::ObjectStore;
use crate::config::SyncerConfig;
use crate::engine::NamespacedName;
use crate::queue::WorkQueue;

/// Runs until cancelled, ticking every `config.interval` and enqueuing the
/// key of every object the primary store currently knows about. Returns
/// immediately if the syncer is disabled (`spec.md §4.6`: unset/zero interval).
pub async fn run(config: SyncerConfig, primary: Arc<dyn ObjectStore>, queue: Arc<WorkQueue<NamespacedName>>) {
    let Some(interval) = config.interval.filter(|d| !d.is_zero()) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        sync_once(primary.as_ref(), &queue).await;
    }
}

async fn sync_once(primary: &dyn ObjectStore, queue: &WorkQueue<NamespacedName>) {
    for object in primary.list_all() {
        let Some(namespace) = object.namespace() else {
            continue;
        };
        queue
            .enqueue_now(NamespacedName {
                namespace,
                name: object.name_any(),
            })
            .await;
    }
}
