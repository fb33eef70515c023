//! C7: load balancers. Pluggable selection over a candidate node set.
//!
//! Grounded on `original_source/src/rosy/node/loadbalancing.py`. The
//! grouping key for services/topics is resolved to `NodeId::name` alone —
//! see `DESIGN.md`'s Open Question decisions, confirmed by
//! `loadbalancing.py`'s `node_name_group_key(node) -> node.id.name`.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;

use crate::mesh::specs::MeshNodeSpec;

pub trait TopicLoadBalancer: Send + Sync {
    fn select(&self, candidates: &[MeshNodeSpec], topic: &str) -> Vec<MeshNodeSpec>;
}

pub trait ServiceLoadBalancer: Send + Sync {
    fn select(&self, candidates: &[MeshNodeSpec], service: &str) -> Option<MeshNodeSpec>;
}

/// Fan-out to every candidate (default topic behaviour absent any grouping).
#[derive(Default)]
pub struct NoopTopicLoadBalancer;

impl TopicLoadBalancer for NoopTopicLoadBalancer {
    fn select(&self, candidates: &[MeshNodeSpec], _topic: &str) -> Vec<MeshNodeSpec> {
        candidates.to_vec()
    }
}

#[derive(Default)]
pub struct RandomLoadBalancer;

impl TopicLoadBalancer for RandomLoadBalancer {
    fn select(&self, candidates: &[MeshNodeSpec], _topic: &str) -> Vec<MeshNodeSpec> {
        pick_random(candidates).into_iter().collect()
    }
}

impl ServiceLoadBalancer for RandomLoadBalancer {
    fn select(&self, candidates: &[MeshNodeSpec], _service: &str) -> Option<MeshNodeSpec> {
        pick_random(candidates)
    }
}

fn pick_random(candidates: &[MeshNodeSpec]) -> Option<MeshNodeSpec> {
    if candidates.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..candidates.len());
    Some(candidates[idx].clone())
}

/// Per-key counter, modulo candidate count; deterministic sequence.
#[derive(Default)]
pub struct RoundRobinLoadBalancer {
    counters: Mutex<HashMap<String, usize>>,
}

impl RoundRobinLoadBalancer {
    fn next_index(&self, key: &str, len: usize) -> usize {
        let mut counters = self.counters.lock();
        let counter = counters.entry(key.to_string()).or_insert(0);
        let idx = *counter % len;
        *counter += 1;
        idx
    }
}

impl TopicLoadBalancer for RoundRobinLoadBalancer {
    fn select(&self, candidates: &[MeshNodeSpec], topic: &str) -> Vec<MeshNodeSpec> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let idx = self.next_index(topic, candidates.len());
        vec![candidates[idx].clone()]
    }
}

impl ServiceLoadBalancer for RoundRobinLoadBalancer {
    fn select(&self, candidates: &[MeshNodeSpec], service: &str) -> Option<MeshNodeSpec> {
        if candidates.is_empty() {
            return None;
        }
        let idx = self.next_index(service, candidates.len());
        Some(candidates[idx].clone())
    }
}

/// Picks the candidate chosen furthest in the past (monotonic clock
/// tie-break); a never-chosen candidate is treated as infinitely stale.
#[derive(Default)]
pub struct LeastRecentlyUsedLoadBalancer {
    last_used: Mutex<HashMap<crate::mesh::specs::NodeId, Instant>>,
}

impl LeastRecentlyUsedLoadBalancer {
    fn pick<'a>(&self, candidates: &'a [MeshNodeSpec]) -> Option<&'a MeshNodeSpec> {
        if candidates.is_empty() {
            return None;
        }
        let last_used = self.last_used.lock();
        candidates.iter().min_by_key(|c| last_used.get(&c.id).copied())
    }

    fn mark_used(&self, id: &crate::mesh::specs::NodeId) {
        self.last_used.lock().insert(id.clone(), Instant::now());
    }
}

impl ServiceLoadBalancer for LeastRecentlyUsedLoadBalancer {
    fn select(&self, candidates: &[MeshNodeSpec], _service: &str) -> Option<MeshNodeSpec> {
        let chosen = self.pick(candidates)?.clone();
        self.mark_used(&chosen.id);
        Some(chosen)
    }
}

impl TopicLoadBalancer for LeastRecentlyUsedLoadBalancer {
    fn select(&self, candidates: &[MeshNodeSpec], _topic: &str) -> Vec<MeshNodeSpec> {
        match self.pick(candidates).cloned() {
            Some(chosen) => {
                self.mark_used(&chosen.id);
                vec![chosen]
            }
            None => Vec::new(),
        }
    }
}

/// Partitions candidates by a key function (default: node name), applies an
/// inner balancer per group, concatenates the per-group results. The
/// default production topic balancer: one representative per name-group
/// receives each message, so duplicated services/listeners don't each get
/// the same message twice (spec.md §4.7).
pub struct GroupingTopicLoadBalancer<K, B> {
    key: K,
    inner: B,
}

impl<K, B> GroupingTopicLoadBalancer<K, B>
where
    K: Fn(&MeshNodeSpec) -> String,
    B: TopicLoadBalancer,
{
    pub fn new(key: K, inner: B) -> Self {
        GroupingTopicLoadBalancer { key, inner }
    }
}

impl<K, B> TopicLoadBalancer for GroupingTopicLoadBalancer<K, B>
where
    K: Fn(&MeshNodeSpec) -> String + Send + Sync,
    B: TopicLoadBalancer,
{
    fn select(&self, candidates: &[MeshNodeSpec], topic: &str) -> Vec<MeshNodeSpec> {
        let mut groups: HashMap<String, Vec<MeshNodeSpec>> = HashMap::new();
        for candidate in candidates {
            groups.entry((self.key)(candidate)).or_default().push(candidate.clone());
        }
        let mut group_keys: Vec<&String> = groups.keys().collect();
        group_keys.sort();

        let mut result = Vec::new();
        for key in group_keys {
            let group = &groups[key];
            result.extend(self.inner.select(group, topic));
        }
        result
    }
}

/// Default grouping key: the node's human-readable name
/// (`node_name_group_key` in the original).
pub fn by_name(node: &MeshNodeSpec) -> String {
    node.id.name.clone()
}

/// Stable default production topic balancer: `Grouping(by_name) ->
/// RoundRobin` (spec.md §6).
pub fn default_topic_load_balancer() -> GroupingTopicLoadBalancer<fn(&MeshNodeSpec) -> String, RoundRobinLoadBalancer>
{
    GroupingTopicLoadBalancer::new(by_name, RoundRobinLoadBalancer::default())
}
