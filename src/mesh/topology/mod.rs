//! C6: topology manager. Authoritative local mirror of the mesh graph,
//! indexed by topic and by service for O(1) lookup, with diff-on-set.
//!
//! Grounded on `original_source` `test_topology.py`.

use std::collections::HashMap;

use crate::mesh::specs::{MeshNodeSpec, MeshTopology, NodeId};

#[derive(Default)]
pub struct MeshTopologyManager {
    topology: MeshTopology,
    by_topic: HashMap<String, Vec<NodeId>>,
    by_service: HashMap<String, Vec<NodeId>>,
}

impl MeshTopologyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topology(&self) -> &MeshTopology {
        &self.topology
    }

    pub fn get_nodes_listening_to_topic(&self, topic: &str) -> Vec<MeshNodeSpec> {
        self.by_topic
            .get(topic)
            .map(|ids| ids.iter().filter_map(|id| self.topology.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn get_nodes_providing_service(&self, service: &str) -> Vec<MeshNodeSpec> {
        self.by_service
            .get(service)
            .map(|ids| ids.iter().filter_map(|id| self.topology.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Replaces the topology and rebuilds indices; returns the nodes
    /// present in the old topology but absent from `new` (by `NodeId`).
    pub fn set_topology(&mut self, new: MeshTopology) -> Vec<MeshNodeSpec> {
        let removed = self.get_removed_nodes(&new);
        self.topology = new;
        self.rebuild_indices();
        removed
    }

    /// Same diff as `set_topology`, without mutating.
    pub fn get_removed_nodes(&self, new: &MeshTopology) -> Vec<MeshNodeSpec> {
        self.topology
            .nodes()
            .filter(|old_node| new.get(&old_node.id).is_none())
            .cloned()
            .collect()
    }

    fn rebuild_indices(&mut self) {
        self.by_topic.clear();
        self.by_service.clear();
        for node in self.topology.nodes() {
            for topic in &node.topics {
                self.by_topic.entry(topic.clone()).or_default().push(node.id.clone());
            }
            for service in &node.services {
                self.by_service
                    .entry(service.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::specs::{AddressFamily, ConnectionSpec};

    fn node(name: &str, topics: &[&str], services: &[&str]) -> MeshNodeSpec {
        let mut spec = MeshNodeSpec::new(
            NodeId::new(name, "localhost"),
            vec![ConnectionSpec::Ip {
                host: "localhost".into(),
                port: 1,
                family: AddressFamily::Inet,
            }],
        );
        spec.topics = topics.iter().map(|s| s.to_string()).collect();
        spec.services = services.iter().map(|s| s.to_string()).collect();
        spec
    }

    #[test]
    fn lookup_by_topic_and_service() {
        let mut manager = MeshTopologyManager::new();
        let node1 = node("node1", &["t"], &[]);
        let node2 = node("node2", &["t"], &["svc"]);
        let mut topology = MeshTopology::new();
        topology.put(node1.clone());
        topology.put(node2.clone());
        manager.set_topology(topology);

        let listeners = manager.get_nodes_listening_to_topic("t");
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[0].id, node1.id);
        assert_eq!(listeners[1].id, node2.id);

        assert_eq!(manager.get_nodes_listening_to_topic("unknown"), vec![]);
        assert_eq!(manager.get_nodes_providing_service("svc"), vec![node2.clone()]);
    }

    #[test]
    fn get_removed_nodes_diffs_by_node_id() {
        let mut manager = MeshTopologyManager::new();
        let node1 = node("node1", &["t"], &[]);
        let node2 = node("node2", &["t"], &[]);
        let mut topology = MeshTopology::new();
        topology.put(node1.clone());
        topology.put(node2.clone());
        manager.set_topology(topology);

        let mut new_topology = MeshTopology::new();
        new_topology.put(node1.clone());

        let removed = manager.get_removed_nodes(&new_topology);
        assert_eq!(removed, vec![node2.clone()]);

        let removed_on_set = manager.set_topology(new_topology);
        assert_eq!(removed_on_set, vec![node2]);
        assert_eq!(manager.get_nodes_listening_to_topic("t"), vec![node1]);
    }

    #[test]
    fn no_removed_nodes_when_topology_unchanged() {
        let mut manager = MeshTopologyManager::new();
        let node1 = node("node1", &[], &[]);
        let mut topology = MeshTopology::new();
        topology.put(node1.clone());
        manager.set_topology(topology.clone());

        assert_eq!(manager.get_removed_nodes(&topology), vec![]);
    }
}
