//! The node runtime itself: identity plus every manager `NodeBuilder` wires
//! together, behind the API a caller touches directly.
//!
//! Grounded on `original_source/src/rosy/node/node.py`'s `Node` class.
//! `topic_has_listeners`/`service_has_providers` answer from the mesh-wide
//! topology, not local registration state — a caller wants to know whether
//! *anyone* is listening, including itself. `listen`/`add_service`/
//! `remove_service` always re-register; `stop_listening` only re-registers
//! when a listener was actually removed.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::mesh::coordinator::CoordinatorClient;
use crate::mesh::error::Result;
use crate::mesh::service::caller::ServiceCaller;
use crate::mesh::service::handler::ServiceHandlerManager;
use crate::mesh::service::types::ServiceCallback;
use crate::mesh::specs::{ConnectionSpec, Data, MeshNodeSpec, NodeId};
use crate::mesh::topic::listener::TopicListenerManager;
use crate::mesh::topic::sender::TopicSender;
use crate::mesh::topic::types::TopicCallback;
use crate::mesh::topology::MeshTopologyManager;

use super::proxy::{ServiceProxy, TopicProxy};

pub struct Node {
    pub(super) id: NodeId,
    pub(super) connection_specs: Vec<ConnectionSpec>,
    pub(super) coordinator: Arc<CoordinatorClient>,
    pub(super) topology: Arc<Mutex<MeshTopologyManager>>,
    pub(super) sender: Arc<TopicSender>,
    pub(super) listener_manager: Arc<TopicListenerManager>,
    pub(super) caller: Arc<ServiceCaller>,
    pub(super) handler_manager: Arc<ServiceHandlerManager>,
    pub(super) topics: Mutex<BTreeSet<String>>,
    pub(super) services: Mutex<BTreeSet<String>>,
    pub(super) registered: AtomicBool,
    pub(super) poll_interval: Duration,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        id: NodeId,
        connection_specs: Vec<ConnectionSpec>,
        coordinator: Arc<CoordinatorClient>,
        topology: Arc<Mutex<MeshTopologyManager>>,
        sender: Arc<TopicSender>,
        listener_manager: Arc<TopicListenerManager>,
        caller: Arc<ServiceCaller>,
        handler_manager: Arc<ServiceHandlerManager>,
        poll_interval: Duration,
    ) -> Self {
        Node {
            id,
            connection_specs,
            coordinator,
            topology,
            sender,
            listener_manager,
            caller,
            handler_manager,
            topics: Mutex::new(BTreeSet::new()),
            services: Mutex::new(BTreeSet::new()),
            registered: AtomicBool::new(false),
            poll_interval,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Publishes to every node listening to `topic` (spec.md §4.8).
    pub async fn send(&self, topic: &str, args: Vec<Data>, kwargs: Vec<(String, Data)>) -> Result<()> {
        self.sender.send(topic, args, kwargs).await
    }

    /// Registers `callback` for `topic`, overwriting any previous one, and
    /// re-registers with the coordinator (mutation always re-registers).
    pub async fn listen(&self, topic: &str, callback: TopicCallback) -> Result<()> {
        self.listener_manager.listen(topic, callback).await;
        self.topics.lock().await.insert(topic.to_string());
        self.register().await
    }

    /// Removes the listener for `topic`, if any, and re-registers only when
    /// one was actually removed.
    pub async fn stop_listening(&self, topic: &str) -> Result<()> {
        if !self.listener_manager.has_listeners(topic).await {
            return Ok(());
        }
        self.listener_manager.stop_listening(topic).await;
        self.topics.lock().await.remove(topic);
        self.register().await
    }

    /// Whether *any* node in the mesh (including this one) currently
    /// listens to `topic`.
    pub async fn topic_has_listeners(&self, topic: &str) -> bool {
        let topology = self.topology.lock().await;
        !topology.get_nodes_listening_to_topic(topic).is_empty()
    }

    /// Polls `topic_has_listeners` at this node's poll interval until it's
    /// true.
    pub async fn wait_for_listener(&self, topic: &str) {
        loop {
            if self.topic_has_listeners(topic).await {
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Wraps `callback` so that, on each upstream message, it only runs if
    /// `downstream_topic` currently has a listener; otherwise this node
    /// stops listening to `upstream_topic` and re-subscribes once a
    /// downstream listener reappears. Useful for backpressure: don't keep
    /// paying to receive a feed nobody downstream can consume.
    pub fn depends_on_listener(
        self: &Arc<Self>,
        upstream_topic: &str,
        downstream_topic: &str,
        callback: TopicCallback,
    ) -> TopicCallback {
        let node = self.clone();
        let upstream_topic = upstream_topic.to_string();
        let downstream_topic = downstream_topic.to_string();

        Arc::new(move |topic: String, args: Vec<Data>, kwargs: Vec<(String, Data)>| {
            let node = node.clone();
            let upstream_topic = upstream_topic.clone();
            let downstream_topic = downstream_topic.clone();
            let callback = callback.clone();
            Box::pin(async move {
                if node.topic_has_listeners(&downstream_topic).await {
                    callback(topic, args, kwargs).await;
                    return;
                }

                let _ = node.stop_listening(&upstream_topic).await;
                tokio::spawn(async move {
                    node.wait_for_listener(&downstream_topic).await;
                    let rewrapped = node.depends_on_listener(&upstream_topic, &downstream_topic, callback);
                    if let Err(e) = node.listen(&upstream_topic, rewrapped).await {
                        debug!(error = %e, topic = %upstream_topic, "failed to re-subscribe after downstream listener reappeared");
                    }
                });
            })
        })
    }

    /// A handle bound to `topic`, for call sites that repeatedly act on one
    /// name.
    pub fn get_topic(self: &Arc<Self>, topic: &str) -> TopicProxy {
        TopicProxy::new(self.clone(), topic.to_string())
    }

    /// Calls `service`, balancing across whichever node currently provides
    /// it (spec.md §4.9).
    pub async fn call(
        &self,
        service: &str,
        args: Vec<Data>,
        kwargs: Vec<(String, Data)>,
        call_timeout: Option<Duration>,
    ) -> Result<Data> {
        self.caller.call(service, args, kwargs, call_timeout).await
    }

    /// Registers `callback` to handle `service`, overwriting any previous
    /// one, and unconditionally re-registers with the coordinator.
    pub async fn add_service(&self, service: &str, callback: ServiceCallback) -> Result<()> {
        self.handler_manager.add_service(service, callback).await;
        self.services.lock().await.insert(service.to_string());
        self.register().await
    }

    /// Removes the handler for `service`, if any, and unconditionally
    /// re-registers with the coordinator.
    pub async fn remove_service(&self, service: &str) -> Result<()> {
        self.handler_manager.remove_service(service).await;
        self.services.lock().await.remove(service);
        self.register().await
    }

    /// Whether any node in the mesh currently provides `service`.
    pub async fn service_has_providers(&self, service: &str) -> bool {
        let topology = self.topology.lock().await;
        !topology.get_nodes_providing_service(service).is_empty()
    }

    /// Polls `service_has_providers` at this node's poll interval until
    /// it's true.
    pub async fn wait_for_service_provider(&self, service: &str) {
        loop {
            if self.service_has_providers(service).await {
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// A handle bound to `service`, for call sites that repeatedly act on
    /// one name.
    pub fn get_service(self: &Arc<Self>, service: &str) -> ServiceProxy {
        ServiceProxy::new(self.clone(), service.to_string())
    }

    /// Registers with the coordinator on first call, updates it on every
    /// call after. `listen`/`stop_listening`/`add_service`/`remove_service`
    /// call this for the caller; it's also exposed directly for a first
    /// registration with no topics or services yet.
    pub async fn register(&self) -> Result<()> {
        let spec = self.build_spec().await;
        let already_registered = self.registered.load(Ordering::SeqCst);
        let result = if already_registered {
            self.coordinator.update(spec).await
        } else {
            self.coordinator.register(spec).await
        };
        if result.is_ok() {
            self.registered.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn build_spec(&self) -> MeshNodeSpec {
        let mut spec = MeshNodeSpec::new(self.id.clone(), self.connection_specs.clone());
        spec.topics = self.topics.lock().await.clone();
        spec.services = self.services.lock().await.clone();
        spec
    }

    /// Never resolves; a convenience so a binary's `main` can simply
    /// `node.forever().await` after wiring its topics and services.
    pub async fn forever(&self) {
        std::future::pending::<()>().await
    }
}
