// Reclassify the reported partition of a job against a reserved pool of nodes.
//
// Jobs that run on a node of the reserved pool, but were submitted through a partition that is not
// one of the pool's own, are moved to the fallback bucket.  Everything else keeps its partition.
// Note the fallback label itself contains the pool label, so the partition scope (which keeps only
// labels that denote the pool) retains those jobs under the fallback key.
//
// Membership is tested on the raw node field of the job.  A multi-node job's node field is a
// hostlist expression and will not match any single pool node, so such jobs keep their reported
// partition.  We log those at debug level but do not try to be clever about them.

use log::debug;
use std::collections::HashSet;

pub const DEFAULT_POOL_LABEL: &str = "kempner";
pub const DEFAULT_FALLBACK_LABEL: &str = "non-kempner";

#[derive(Debug, Clone)]
pub struct ReservedPool {
    label: String,
    fallback: String,
    nodes: HashSet<String>,
}

impl ReservedPool {
    pub fn new(label: &str, fallback: &str, nodes: HashSet<String>) -> ReservedPool {
        ReservedPool {
            label: label.to_string(),
            fallback: fallback.to_string(),
            nodes,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// True if the partition (or group) name belongs to the pool, ie contains the pool label.

    pub fn denotes_pool(&self, name: &str) -> bool {
        name.contains(self.label.as_str())
    }

    pub fn contains_node(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }

    /// The partition-scope key for a job that ran on `node` and was submitted to `partition`.

    pub fn classify<'a>(&'a self, node: &str, partition: &'a str) -> &'a str {
        if self.contains_node(node) {
            if !self.denotes_pool(partition) {
                return &self.fallback;
            }
        } else if node.contains('[') || node.contains(',') {
            debug!("Multi-node job on `{node}` keeps partition `{partition}`");
        }
        partition
    }
}

impl Default for ReservedPool {
    fn default() -> ReservedPool {
        ReservedPool::new(DEFAULT_POOL_LABEL, DEFAULT_FALLBACK_LABEL, HashSet::new())
    }
}

#[cfg(test)]
fn test_pool() -> ReservedPool {
    ReservedPool::new(
        DEFAULT_POOL_LABEL,
        DEFAULT_FALLBACK_LABEL,
        HashSet::from(["holygpu8a11101".to_string(), "holygpu8a11102".to_string()]),
    )
}

#[test]
fn test_classify() {
    let pool = test_pool();
    assert!(pool.classify("holygpu8a11101", "general") == "non-kempner");
    assert!(pool.classify("holygpu8a11101", "kempner_requeue") == "kempner_requeue");
    assert!(pool.classify("holygpu8a11102", "kempner") == "kempner");
    assert!(pool.classify("holygpu2c0923", "general") == "general");
    assert!(pool.classify("holygpu2c0923", "kempner") == "kempner");

    // Whole-field membership only
    assert!(pool.classify("holygpu8a[11101-11102]", "general") == "general");
    assert!(pool.classify("holygpu8a1110", "general") == "general");

    assert!(pool.denotes_pool("non-kempner"));
    assert!(pool.denotes_pool("kempner_h100"));
    assert!(!pool.denotes_pool("gpu"));
}

#[test]
fn test_empty_pool() {
    let pool = ReservedPool::default();
    assert!(pool.node_count() == 0);
    assert!(pool.label() == DEFAULT_POOL_LABEL && pool.fallback() == DEFAULT_FALLBACK_LABEL);
    assert!(pool.classify("holygpu8a11101", "general") == "general");
    assert!(pool.classify("holygpu8a11101", "kempner") == "kempner");
}
