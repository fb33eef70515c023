//! Listener registry + per-topic ordered inbound dispatch.
//!
//! Grounded on spec.md §4.8: one callback per topic (re-register
//! overwrites), each inbound topic frame handed to a per-topic bounded FIFO
//! consumed by a dedicated task — two frames on the same topic serialize,
//! distinct topics run in parallel. No listener registered ⇒ silent drop.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::mesh::specs::Data;
use crate::mesh::topic::types::TopicCallback;

struct DispatchQueue {
    sender: mpsc::Sender<(Vec<Data>, Vec<(String, Data)>)>,
    worker: tokio::task::JoinHandle<()>,
}

/// `topic -> callback`, plus the bounded per-topic dispatch queue that feeds
/// it. Re-registering a topic replaces the callback and restarts its queue.
pub struct TopicListenerManager {
    listeners: Mutex<HashMap<String, Arc<DispatchQueue>>>,
    queue_maxsize: usize,
}

impl TopicListenerManager {
    pub fn new(queue_maxsize: usize) -> Self {
        TopicListenerManager {
            listeners: Mutex::new(HashMap::new()),
            queue_maxsize,
        }
    }

    pub async fn listen(&self, topic: &str, callback: TopicCallback) {
        let (tx, mut rx) = mpsc::channel::<(Vec<Data>, Vec<(String, Data)>)>(self.queue_maxsize);
        let topic_owned = topic.to_string();
        let worker = tokio::spawn(async move {
            while let Some((args, kwargs)) = rx.recv().await {
                callback(topic_owned.clone(), args, kwargs).await;
            }
        });

        let queue = Arc::new(DispatchQueue { sender: tx, worker });
        let mut listeners = self.listeners.lock().await;
        if let Some(old) = listeners.insert(topic.to_string(), queue) {
            old.worker.abort();
        }
    }

    pub async fn stop_listening(&self, topic: &str) {
        let removed = {
            let mut listeners = self.listeners.lock().await;
            listeners.remove(topic)
        };
        if let Some(queue) = removed {
            queue.worker.abort();
        }
    }

    pub async fn has_listeners(&self, topic: &str) -> bool {
        self.listeners.lock().await.contains_key(topic)
    }

    /// Enqueues an inbound frame for dispatch; silently drops it if there's
    /// no listener (the publisher's view of the topology may be stale).
    pub async fn dispatch(&self, topic: &str, args: Vec<Data>, kwargs: Vec<(String, Data)>) {
        let queue = {
            let listeners = self.listeners.lock().await;
            listeners.get(topic).cloned()
        };
        match queue {
            Some(queue) => {
                if queue.sender.send((args, kwargs)).await.is_err() {
                    debug!(topic, "dispatch queue worker gone, dropping frame");
                }
            }
            None => debug!(topic, "no listener registered, dropping inbound frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn dispatch_without_listener_is_silently_dropped() {
        let manager = TopicListenerManager::new(10);
        manager.dispatch("nobody-home", vec![], vec![]).await;
    }

    #[tokio::test]
    async fn registering_same_topic_overwrites_callback() {
        let manager = TopicListenerManager::new(10);
        let count_a = StdArc::new(AtomicUsize::new(0));
        let count_b = StdArc::new(AtomicUsize::new(0));

        let ca = count_a.clone();
        manager
            .listen(
                "t",
                Arc::new(move |_t, _a, _k| {
                    let ca = ca.clone();
                    Box::pin(async move {
                        ca.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await;

        let cb = count_b.clone();
        manager
            .listen(
                "t",
                Arc::new(move |_t, _a, _k| {
                    let cb = cb.clone();
                    Box::pin(async move {
                        cb.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await;

        manager.dispatch("t", vec![], vec![]).await;
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(count_a.load(Ordering::SeqCst), 0);
        assert_eq!(count_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn has_listeners_reflects_registration_state() {
        let manager = TopicListenerManager::new(10);
        assert!(!manager.has_listeners("t").await);
        manager
            .listen("t", Arc::new(|_t, _a, _k| Box::pin(async {})))
            .await;
        assert!(manager.has_listeners("t").await);
        manager.stop_listening("t").await;
        assert!(!manager.has_listeners("t").await);
    }
}
