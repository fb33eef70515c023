//! The mesh's shared data model: node identity, advertisable connection
//! specs, and the topology snapshot the coordinator distributes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity triple for a single running node process.
///
/// `name` is a human label and may repeat across processes (it doubles as
/// the default load-balancer grouping key, see `mesh::loadbalancing`).
/// `hostname` is the advertised network hostname. `uuid` is generated once
/// at node start and uniquely identifies this process instance.
///
/// Equality, hashing, and ordering are all by the full triple.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub name: String,
    pub hostname: String,
    pub uuid: Uuid,
}

impl NodeId {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>) -> Self {
        NodeId {
            name: name.into(),
            hostname: hostname.into(),
            uuid: Uuid::new_v4(),
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.name, self.hostname, self.uuid)
    }
}

/// Address family for an IP connection spec.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

/// An advertisable endpoint a peer can dial to reach a node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConnectionSpec {
    /// A TCP endpoint reachable by any client that can resolve `host`.
    Ip {
        host: String,
        port: u16,
        family: AddressFamily,
    },
    /// A Unix-domain socket path, only usable by clients on the same `host`.
    Unix { path: String, host: String },
}

/// The advertisable record of one node: its identity, how to reach it, and
/// what it currently listens to / provides.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MeshNodeSpec {
    pub id: NodeId,
    pub connection_specs: Vec<ConnectionSpec>,
    pub topics: BTreeSet<String>,
    pub services: BTreeSet<String>,
}

impl MeshNodeSpec {
    /// `connection_specs` must be non-empty; the coordinator and topology
    /// manager don't enforce this themselves; callers (the node runtime)
    /// must not construct an advertisable spec with no way to reach it.
    pub fn new(id: NodeId, connection_specs: Vec<ConnectionSpec>) -> Self {
        debug_assert!(!connection_specs.is_empty());
        MeshNodeSpec {
            id,
            connection_specs,
            topics: BTreeSet::new(),
            services: BTreeSet::new(),
        }
    }
}

/// An unordered collection of `MeshNodeSpec`, at most one per `NodeId`. The
/// coordinator owns the authoritative copy; every node keeps a local
/// mirror, replaced wholesale on each topology broadcast.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MeshTopology {
    nodes: Vec<MeshNodeSpec>,
}

impl MeshTopology {
    pub fn new() -> Self {
        MeshTopology { nodes: Vec::new() }
    }

    /// Stable iteration by `NodeId`, for deterministic behaviour across the
    /// mesh (spec.md §4.6: "iteration over nodes is stable by NodeId").
    pub fn nodes(&self) -> impl Iterator<Item = &MeshNodeSpec> {
        self.nodes.iter()
    }

    pub fn get(&self, id: &NodeId) -> Option<&MeshNodeSpec> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Insert or replace the entry for `spec.id`, preserving the position of
    /// the old entry if one existed, else appending.
    pub fn put(&mut self, spec: MeshNodeSpec) {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == spec.id) {
            *existing = spec;
        } else {
            self.nodes.push(spec);
        }
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<MeshNodeSpec> {
        let idx = self.nodes.iter().position(|n| &n.id == id)?;
        Some(self.nodes.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// The dynamically-typed value carried by topic args/kwargs and service
/// payloads — analogous to the original's pickle-able `Any`, but restricted
/// to whatever the configured payload codec (`mesh::codec::payload`) can
/// (de)serialize in a self-describing way.
pub type Data = serde_json::Value;

/// A fire-and-forget multi-subscriber message.
#[derive(Clone, Debug)]
pub struct TopicMessage {
    pub topic: String,
    pub args: Vec<Data>,
    pub kwargs: Vec<(String, Data)>,
}

pub type RequestId = u16;

/// A one-of-N RPC request. `id` is unique per (caller, caller-side
/// connection) at any instant; the id space is reused once the matching
/// response arrives or the request is cancelled.
#[derive(Clone, Debug)]
pub struct ServiceRequest {
    pub id: RequestId,
    pub service: String,
    pub args: Vec<Data>,
    pub kwargs: Vec<(String, Data)>,
}

#[derive(Clone, Debug)]
pub enum ServiceStatus {
    Ok(Data),
    Error(String),
}

#[derive(Clone, Debug)]
pub struct ServiceResponse {
    pub id: RequestId,
    pub status: ServiceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_equality_is_by_full_triple() {
        let a = NodeId::new("worker", "host-a");
        let mut b = a.clone();
        b.hostname = "host-b".into();
        assert_ne!(a, b);
    }

    #[test]
    fn topology_put_replaces_in_place() {
        let id = NodeId::new("worker", "host-a");
        let spec_a = MeshNodeSpec::new(
            id.clone(),
            vec![ConnectionSpec::Ip {
                host: "host-a".into(),
                port: 1,
                family: AddressFamily::Inet,
            }],
        );
        let other_id = NodeId::new("other", "host-a");
        let other = MeshNodeSpec::new(
            other_id,
            vec![ConnectionSpec::Ip {
                host: "host-a".into(),
                port: 2,
                family: AddressFamily::Inet,
            }],
        );

        let mut topology = MeshTopology::new();
        topology.put(other.clone());
        topology.put(spec_a.clone());

        let mut spec_a2 = spec_a.clone();
        spec_a2.topics.insert("t".into());
        topology.put(spec_a2.clone());

        assert_eq!(topology.len(), 2);
        assert_eq!(topology.get(&id), Some(&spec_a2));
        // position preserved: the second entry inserted stays second.
        assert_eq!(topology.nodes().nth(1), Some(&spec_a2));
        let _ = other;
    }

    #[test]
    fn registering_same_node_twice_yields_one_entry() {
        let id = NodeId::new("worker", "host-a");
        let make = |topics: &[&str]| {
            let mut spec = MeshNodeSpec::new(
                id.clone(),
                vec![ConnectionSpec::Ip {
                    host: "host-a".into(),
                    port: 1,
                    family: AddressFamily::Inet,
                }],
            );
            spec.topics = topics.iter().map(|s| s.to_string()).collect();
            spec
        };

        let mut topology = MeshTopology::new();
        topology.put(make(&["a"]));
        topology.put(make(&["a", "b"]));

        assert_eq!(topology.len(), 1);
        assert_eq!(topology.get(&id).unwrap().topics.len(), 2);
    }
}
