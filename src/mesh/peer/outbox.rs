//! C5: per-node outbox. Bounded FIFO with TTL, head-drop on overflow, one
//! worker task per peer.
//!
//! Grounded on `original_source` `test/.../test_outbox.py` — the only
//! retrieved source for `rosy.node.topic.outbox`, since `outbox.py` itself
//! wasn't in the pack; behaviour reconstructed from its test suite:
//! `maxsize=1` with two rapid sends keeps the newest and drops the oldest;
//! `ttl=0` makes every popped item already-expired; `stop()` is idempotent
//! and safe on an outbox nobody ever created.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::mesh::error::{Error, Result};
use crate::mesh::peer::connection::PeerConnectionPool;
use crate::mesh::specs::{ConnectionSpec, NodeId};

struct QueueItem {
    deadline: Instant,
    frame: Vec<u8>,
}

struct Queue {
    items: VecDeque<QueueItem>,
    maxsize: usize,
}

/// One bounded FIFO + worker task per remote peer. The queue is a plain
/// `Mutex<VecDeque>` (not `tokio::sync::mpsc`, whose bounded channel has no
/// producer-side "drop oldest on full" primitive) guarded by a `Notify` to
/// wake the worker.
pub struct NodeOutbox {
    queue: Arc<Mutex<Queue>>,
    notify: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    worker: tokio::task::JoinHandle<()>,
}

impl NodeOutbox {
    pub fn new(
        node_id: NodeId,
        connection_specs: Vec<ConnectionSpec>,
        pool: Arc<PeerConnectionPool>,
        maxsize: usize,
    ) -> Self {
        let queue = Arc::new(Mutex::new(Queue {
            items: VecDeque::with_capacity(maxsize),
            maxsize,
        }));
        let notify = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let worker = tokio::spawn(run_worker(
            node_id,
            connection_specs,
            pool,
            queue.clone(),
            notify.clone(),
            stopped.clone(),
        ));

        NodeOutbox {
            queue,
            notify,
            stopped,
            worker,
        }
    }

    /// Enqueues `(now + ttl, frame)` and returns immediately. If the queue
    /// is at `maxsize`, the oldest entry is dropped to make room.
    pub async fn send(&self, frame: Vec<u8>, ttl: Duration) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::connection("outbox has been stopped"));
        }
        let mut queue = self.queue.lock().await;
        if queue.items.len() >= queue.maxsize {
            queue.items.pop_front();
        }
        queue.items.push_back(QueueItem {
            deadline: Instant::now() + ttl,
            frame,
        });
        drop(queue);
        self.notify.notify_one();
        Ok(())
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.worker.abort();
        self.notify.notify_one();
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.queue.lock().await.items.len()
    }
}

async fn run_worker(
    node_id: NodeId,
    connection_specs: Vec<ConnectionSpec>,
    pool: Arc<PeerConnectionPool>,
    queue: Arc<Mutex<Queue>>,
    notify: Arc<Notify>,
    stopped: Arc<AtomicBool>,
) {
    loop {
        let item = {
            let mut guard = queue.lock().await;
            guard.items.pop_front()
        };

        let item = match item {
            Some(item) => item,
            None => {
                if stopped.load(Ordering::SeqCst) {
                    return;
                }
                notify.notified().await;
                continue;
            }
        };

        if Instant::now() > item.deadline {
            debug!(node = %node_id, "dropping expired outbox frame");
            continue;
        }

        match pool.get_connection_for(&node_id, &connection_specs).await {
            Ok(conn) => {
                if let Err(e) = conn.writer.write_framed(&item.frame).await {
                    debug!(node = %node_id, error = %e, "outbox write failed, discarding frame");
                    // swallowed: the pool opens a fresh connection on the
                    // next pop (spec.md §4.5).
                }
            }
            Err(e) => {
                debug!(node = %node_id, error = %e, "outbox could not obtain connection, discarding frame");
            }
        }
    }
}

/// `NodeId -> NodeOutbox`, created on first use.
pub struct NodeOutboxManager {
    pool: Arc<PeerConnectionPool>,
    outboxes: Mutex<HashMap<NodeId, Arc<NodeOutbox>>>,
    ttl: Duration,
    maxsize: usize,
}

impl NodeOutboxManager {
    pub fn new(pool: Arc<PeerConnectionPool>, ttl: Duration, maxsize: usize) -> Self {
        NodeOutboxManager {
            pool,
            outboxes: Mutex::new(HashMap::new()),
            ttl,
            maxsize,
        }
    }

    pub async fn get_outbox(
        &self,
        node_id: &NodeId,
        connection_specs: &[ConnectionSpec],
    ) -> Arc<NodeOutbox> {
        let mut outboxes = self.outboxes.lock().await;
        if let Some(outbox) = outboxes.get(node_id) {
            return outbox.clone();
        }
        let outbox = Arc::new(NodeOutbox::new(
            node_id.clone(),
            connection_specs.to_vec(),
            self.pool.clone(),
            self.maxsize,
        ));
        outboxes.insert(node_id.clone(), outbox.clone());
        outbox
    }

    pub async fn stop_outbox(&self, node_id: &NodeId) {
        let removed = {
            let mut outboxes = self.outboxes.lock().await;
            outboxes.remove(node_id)
        };
        if let Some(outbox) = removed {
            outbox.stop();
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::peer::connection::PeerConnectionBuilder;

    fn dummy_pool() -> Arc<PeerConnectionPool> {
        Arc::new(PeerConnectionPool::new(PeerConnectionBuilder {
            local_hostname: "localhost".into(),
            authkey: None,
            challenge_len: 32,
            auth_timeout: Duration::from_secs(1),
        }))
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_rejects_further_sends() {
        let pool = dummy_pool();
        let manager = NodeOutboxManager::new(pool, Duration::from_secs(5), 100);
        let id = NodeId::new("peer", "localhost");
        let outbox = manager.get_outbox(&id, &[]).await;
        outbox.stop();
        outbox.stop();
        assert!(outbox.send(vec![1, 2, 3], Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test]
    async fn stopping_nonexistent_outbox_is_a_no_op() {
        let pool = dummy_pool();
        let manager = NodeOutboxManager::new(pool, Duration::from_secs(5), 100);
        let id = NodeId::new("ghost", "localhost");
        manager.stop_outbox(&id).await;
    }

    #[tokio::test]
    async fn overflow_drops_oldest_entry() {
        // Use a connection pool that will fail to connect (no specs), so
        // the worker's pop-and-discard doesn't race the test's own
        // inspection of queue length; instead verify directly against the
        // internal queue before the worker has a chance to drain it by
        // pausing between sends without yielding.
        let pool = dummy_pool();
        let manager = NodeOutboxManager::new(pool, Duration::from_secs(5), 1);
        let id = NodeId::new("peer", "localhost");
        let outbox = manager.get_outbox(&id, &[]).await;

        outbox.send(b"first".to_vec(), Duration::from_secs(5)).await.unwrap();
        outbox.send(b"second".to_vec(), Duration::from_secs(5)).await.unwrap();

        // maxsize=1: at most one item should ever be queued at a time.
        assert!(outbox.len().await <= 1);
    }
}
