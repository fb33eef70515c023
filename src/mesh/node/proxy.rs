//! Thin handles bound to a single topic or service name, so a call site that
//! repeatedly acts on one name doesn't have to repeat it.
//!
//! Grounded on `original_source/src/rosy/node/node.py`'s `TopicProxy`/
//! `ServiceProxy`.

use std::sync::Arc;
use std::time::Duration;

use crate::mesh::error::Result;
use crate::mesh::service::types::ServiceCallback;
use crate::mesh::specs::Data;
use crate::mesh::topic::types::TopicCallback;

use super::node::Node;

pub struct TopicProxy {
    node: Arc<Node>,
    topic: String,
}

impl TopicProxy {
    pub(super) fn new(node: Arc<Node>, topic: String) -> Self {
        TopicProxy { node, topic }
    }

    pub fn name(&self) -> &str {
        &self.topic
    }

    pub async fn send(&self, args: Vec<Data>, kwargs: Vec<(String, Data)>) -> Result<()> {
        self.node.send(&self.topic, args, kwargs).await
    }

    pub async fn listen(&self, callback: TopicCallback) -> Result<()> {
        self.node.listen(&self.topic, callback).await
    }

    pub async fn stop_listening(&self) -> Result<()> {
        self.node.stop_listening(&self.topic).await
    }

    pub async fn has_listeners(&self) -> bool {
        self.node.topic_has_listeners(&self.topic).await
    }

    pub async fn wait_for_listener(&self) {
        self.node.wait_for_listener(&self.topic).await
    }

    /// Wraps `callback` with `Node::depends_on_listener`, pinned to this
    /// proxy's topic as the downstream dependency.
    pub fn depends_on(&self, upstream_topic: &str, callback: TopicCallback) -> TopicCallback {
        self.node.depends_on_listener(upstream_topic, &self.topic, callback)
    }
}

pub struct ServiceProxy {
    node: Arc<Node>,
    service: String,
}

impl ServiceProxy {
    pub(super) fn new(node: Arc<Node>, service: String) -> Self {
        ServiceProxy { node, service }
    }

    pub fn name(&self) -> &str {
        &self.service
    }

    pub async fn call(&self, args: Vec<Data>, kwargs: Vec<(String, Data)>, call_timeout: Option<Duration>) -> Result<Data> {
        self.node.call(&self.service, args, kwargs, call_timeout).await
    }

    pub async fn add_service(&self, callback: ServiceCallback) -> Result<()> {
        self.node.add_service(&self.service, callback).await
    }

    pub async fn remove_service(&self) -> Result<()> {
        self.node.remove_service(&self.service).await
    }

    pub async fn has_providers(&self) -> bool {
        self.node.service_has_providers(&self.service).await
    }

    pub async fn wait_for_provider(&self) {
        self.node.wait_for_service_provider(&self.service).await
    }
}
