//! `Sender`: selects peers, encodes once, enqueues per-peer.
//!
//! Grounded on spec.md §4.8 and the self-send short-circuit described in
//! §9 ("inbound self-sends must not loop through the transport") —
//! matching the lazy-invoke pattern in
//! `original_source/src/easymesh/node/node.py`'s older `MeshNode.send`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use crate::mesh::codec::frame::WireTopicFrame;
use crate::mesh::codec::payload::{DynPayloadCodec, PayloadCodec};
use crate::mesh::error::Result;
use crate::mesh::loadbalancing::TopicLoadBalancer;
use crate::mesh::peer::outbox::NodeOutboxManager;
use crate::mesh::specs::{Data, NodeId};
use crate::mesh::topic::listener::TopicListenerManager;
use crate::mesh::topology::MeshTopologyManager;

pub struct TopicSender {
    pub local_id: NodeId,
    pub topology: Arc<Mutex<MeshTopologyManager>>,
    pub load_balancer: Arc<dyn TopicLoadBalancer>,
    pub outbox_manager: Arc<NodeOutboxManager>,
    pub listener_manager: Arc<TopicListenerManager>,
    pub codec: DynPayloadCodec,
    pub outbox_ttl: Duration,
}

impl TopicSender {
    pub async fn send(&self, topic: &str, args: Vec<Data>, kwargs: Vec<(String, Data)>) -> Result<()> {
        let candidates = {
            let topology = self.topology.lock().await;
            topology.get_nodes_listening_to_topic(topic)
        };
        if candidates.is_empty() {
            return Ok(());
        }

        let selected = self.load_balancer.select(&candidates, topic);
        if selected.is_empty() {
            return Ok(());
        }

        // Encode once; local self-sends reuse the structured args/kwargs
        // directly and never pay for encoding.
        let needs_wire_frame = selected.iter().any(|n| n.id != self.local_id);
        let wire_frame = if needs_wire_frame {
            Some(self.encode_frame(topic, &args, &kwargs)?)
        } else {
            None
        };

        for node in &selected {
            if node.id == self.local_id {
                self.listener_manager
                    .dispatch(topic, args.clone(), kwargs.clone())
                    .await;
                continue;
            }

            let frame = wire_frame
                .clone()
                .expect("wire frame computed whenever a non-local node is selected");
            let outbox = self
                .outbox_manager
                .get_outbox(&node.id, &node.connection_specs)
                .await;
            if let Err(e) = outbox.send(frame, self.outbox_ttl).await {
                debug!(node = %node.id, error = %e, "failed to enqueue topic send");
            }
        }

        Ok(())
    }

    fn encode_frame(&self, topic: &str, args: &[Data], kwargs: &[(String, Data)]) -> Result<Vec<u8>> {
        let wire_args = args
            .iter()
            .map(|a| self.codec.encode(a))
            .collect::<Result<Vec<_>>>()?;
        let wire_kwargs = kwargs
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.codec.encode(v)?)))
            .collect::<Result<Vec<_>>>()?;

        WireTopicFrame {
            topic: topic.to_string(),
            args: wire_args,
            kwargs: wire_kwargs,
        }
        .encode()
    }
}
