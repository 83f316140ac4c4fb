//! Node picking
//!
//! Maps shards to alive nodes with a consistent hash ring so repeated runs
//! over an unchanged node set give the same placement, and a node change
//! only moves the shards that have to move. Affinity rules short-circuit
//! the ring.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use crate::error::{MetaError, Result};
use crate::metadata::{now_ms, NodeName, RegisteredNode, ShardId};
use crate::scheduler::ShardAffinityRule;

/// Inputs shared by every pick call
#[derive(Default)]
pub struct NodePickerConfig {
    pub num_total_shards: u32,
    pub shard_affinities: HashMap<ShardId, ShardAffinityRule>,
}

pub trait NodePicker: Send + Sync {
    /// Choose a node for each given shard among the alive registered nodes.
    fn pick_node(
        &self,
        config: &NodePickerConfig,
        shard_ids: &[ShardId],
        nodes: &[RegisteredNode],
    ) -> Result<HashMap<ShardId, NodeName>>;
}

/// Consistent uniform-hash picker
pub struct ConsistentHashNodePicker {
    virtual_nodes: usize,
}

impl Default for ConsistentHashNodePicker {
    fn default() -> Self {
        Self { virtual_nodes: 128 }
    }
}

impl ConsistentHashNodePicker {
    pub fn new(virtual_nodes: usize) -> Self {
        Self { virtual_nodes }
    }
}

fn hash_of(value: &str) -> u64 {
    // DefaultHasher::new() uses fixed keys, so placement is deterministic
    // across runs of the same binary.
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl NodePicker for ConsistentHashNodePicker {
    fn pick_node(
        &self,
        config: &NodePickerConfig,
        shard_ids: &[ShardId],
        nodes: &[RegisteredNode],
    ) -> Result<HashMap<ShardId, NodeName>> {
        let now = now_ms();
        let mut alive: Vec<&str> = nodes
            .iter()
            .filter(|n| !n.is_expired(now))
            .map(|n| n.node.name.as_str())
            .collect();
        alive.sort_unstable();
        alive.dedup();
        if alive.is_empty() {
            return Err(MetaError::precondition_failed(
                "node number not enough, no alive node",
            ));
        }

        let mut ring: BTreeMap<u64, &str> = BTreeMap::new();
        for node in &alive {
            for replica in 0..self.virtual_nodes {
                ring.insert(hash_of(&format!("{}#{}", node, replica)), node);
            }
        }

        let mut mapping = HashMap::with_capacity(shard_ids.len());
        for shard_id in shard_ids {
            // An affinity rule with an alive target overrides the ring.
            if let Some(rule) = config.shard_affinities.get(shard_id) {
                if let Some(node) = rule.nodes.iter().find(|n| alive.contains(&n.as_str())) {
                    mapping.insert(*shard_id, node.clone());
                    continue;
                }
            }
            let key = hash_of(&format!("shard_{}", shard_id));
            let node = ring
                .range(key..)
                .next()
                .or_else(|| ring.iter().next())
                .map(|(_, node)| *node)
                .ok_or_else(|| MetaError::internal("empty hash ring"))?;
            mapping.insert(*shard_id, node.to_string());
        }
        Ok(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Node, NodeState, NodeStats};

    fn node(name: &str, expired: bool) -> RegisteredNode {
        let last_touch_time = if expired { 0 } else { now_ms() };
        RegisteredNode::new(
            Node {
                name: name.to_string(),
                stats: NodeStats::default(),
                last_touch_time,
                state: NodeState::Online,
            },
            vec![],
        )
    }

    #[test]
    fn test_deterministic_mapping() {
        let picker = ConsistentHashNodePicker::default();
        let config = NodePickerConfig::default();
        let nodes = vec![node("n1", false), node("n2", false), node("n3", false)];
        let shards: Vec<ShardId> = (0..16).collect();

        let first = picker.pick_node(&config, &shards, &nodes).unwrap();
        let second = picker.pick_node(&config, &shards, &nodes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_all_nodes_used() {
        let picker = ConsistentHashNodePicker::default();
        let config = NodePickerConfig::default();
        let nodes = vec![node("n1", false), node("n2", false)];
        let shards: Vec<ShardId> = (0..8).collect();

        let mapping = picker.pick_node(&config, &shards, &nodes).unwrap();
        let used: std::collections::HashSet<_> = mapping.values().collect();
        assert_eq!(used.len(), 2, "8 shards over 2 nodes must use both");
    }

    #[test]
    fn test_expired_nodes_ignored() {
        let picker = ConsistentHashNodePicker::default();
        let config = NodePickerConfig::default();
        let nodes = vec![node("n1", false), node("n2", true)];
        let shards: Vec<ShardId> = (0..8).collect();

        let mapping = picker.pick_node(&config, &shards, &nodes).unwrap();
        assert!(mapping.values().all(|n| n == "n1"));
    }

    #[test]
    fn test_no_alive_node_is_an_error() {
        let picker = ConsistentHashNodePicker::default();
        let config = NodePickerConfig::default();
        let err = picker
            .pick_node(&config, &[0], &[node("n1", true)])
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::PreconditionFailed);
    }

    #[test]
    fn test_affinity_overrides_ring() {
        let picker = ConsistentHashNodePicker::default();
        let mut config = NodePickerConfig::default();
        config.shard_affinities.insert(
            3,
            ShardAffinityRule {
                shard_id: 3,
                nodes: vec!["n2".to_string()],
                priority: 1,
            },
        );
        let nodes = vec![node("n1", false), node("n2", false)];

        let mapping = picker.pick_node(&config, &[3], &nodes).unwrap();
        assert_eq!(mapping[&3], "n2");
    }

    #[test]
    fn test_affinity_to_dead_node_falls_back() {
        let picker = ConsistentHashNodePicker::default();
        let mut config = NodePickerConfig::default();
        config.shard_affinities.insert(
            3,
            ShardAffinityRule {
                shard_id: 3,
                nodes: vec!["gone".to_string()],
                priority: 1,
            },
        );
        let nodes = vec![node("n1", false)];

        let mapping = picker.pick_node(&config, &[3], &nodes).unwrap();
        assert_eq!(mapping[&3], "n1");
    }
}
