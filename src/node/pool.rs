//! Penalty-ranked node selection.

use std::sync::Arc;

use tracing::debug;

use super::{AudioNode, NodeId};
use crate::error::{Error, Result};

/// Registered nodes, in registration order.
#[derive(Clone, Default)]
pub struct NodePool {
    nodes: Vec<Arc<dyn AudioNode>>,
}

impl NodePool {
    pub fn new(nodes: Vec<Arc<dyn AudioNode>>) -> Self {
        Self { nodes }
    }

    pub fn register(&mut self, node: Arc<dyn AudioNode>) {
        self.nodes.push(node);
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<dyn AudioNode>> {
        self.nodes.iter().find(|node| node.id() == id).cloned()
    }

    pub fn nodes(&self) -> &[Arc<dyn AudioNode>] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Lowest-penalty non-fatal node. When some candidate advertises
    /// `region`, only those candidates are ranked. Ties go to the node
    /// registered first.
    pub fn select(&self, region: Option<&str>) -> Result<Arc<dyn AudioNode>> {
        let candidates: Vec<&Arc<dyn AudioNode>> = self.nodes.iter().filter(|node| !node.is_fatal()).collect();

        let regional: Vec<&Arc<dyn AudioNode>> = match region {
            Some(region) => candidates
                .iter()
                .copied()
                .filter(|node| node.region().eq_ignore_ascii_case(region))
                .collect(),
            None => Vec::new(),
        };
        let ranked = if regional.is_empty() { candidates } else { regional };

        // min_by_key devuelve el primero entre empates
        let chosen = ranked
            .into_iter()
            .min_by_key(|node| node.penalty())
            .map(Arc::clone)
            .ok_or(Error::NoNodes)?;

        debug!(node_id = %chosen.id(), region = ?region, "🎯 Nodo seleccionado");
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::testing::FakeNode;
    use std::sync::atomic::Ordering;

    fn pool_of(nodes: Vec<Arc<FakeNode>>) -> NodePool {
        NodePool::new(nodes.into_iter().map(|node| node as Arc<dyn AudioNode>).collect())
    }

    #[test]
    fn region_restricts_then_penalty_ranks() {
        let pool = pool_of(vec![
            Arc::new(FakeNode::new(0, "regionA", 5)),
            Arc::new(FakeNode::new(1, "regionB", 2)),
            Arc::new(FakeNode::new(2, "regionA", 9)),
        ]);

        assert_eq!(pool.select(Some("regionA")).unwrap().id(), NodeId(0));
        assert_eq!(pool.select(None).unwrap().id(), NodeId(1));
    }

    #[test]
    fn unknown_region_falls_back_to_all_nodes() {
        let pool = pool_of(vec![
            Arc::new(FakeNode::new(0, "us", 7)),
            Arc::new(FakeNode::new(1, "eu", 3)),
        ]);
        assert_eq!(pool.select(Some("brazil")).unwrap().id(), NodeId(1));
    }

    #[test]
    fn ties_go_to_first_registered() {
        let pool = pool_of(vec![
            Arc::new(FakeNode::new(0, "us", 4)),
            Arc::new(FakeNode::new(1, "us", 4)),
            Arc::new(FakeNode::new(2, "us", 4)),
        ]);
        for _ in 0..5 {
            assert_eq!(pool.select(Some("us")).unwrap().id(), NodeId(0));
        }
    }

    #[test]
    fn fatal_nodes_are_skipped() {
        let healthy = Arc::new(FakeNode::new(1, "us", 50));
        let broken = Arc::new(FakeNode::new(0, "us", 0));
        broken.fatal.store(true, Ordering::SeqCst);
        let pool = pool_of(vec![broken.clone(), healthy]);

        assert_eq!(pool.select(Some("us")).unwrap().id(), NodeId(1));

        // Si todos los nodos de la región son fatales se usa cualquier otro
        let pool = pool_of(vec![broken, Arc::new(FakeNode::new(2, "eu", 1))]);
        assert_eq!(pool.select(Some("us")).unwrap().id(), NodeId(2));
    }

    #[test]
    fn empty_pool_is_an_error() {
        let pool = NodePool::default();
        assert!(matches!(pool.select(None), Err(Error::NoNodes)));

        let only = Arc::new(FakeNode::new(0, "us", 0));
        only.fatal.store(true, Ordering::SeqCst);
        let all_fatal = NodePool::new(vec![only as Arc<dyn AudioNode>]);
        assert!(matches!(all_fatal.select(Some("us")), Err(Error::NoNodes)));
    }

    #[test]
    fn get_by_id() {
        let pool = pool_of(vec![Arc::new(FakeNode::new(3, "us", 0))]);
        assert!(pool.get(NodeId(3)).is_some());
        assert!(pool.get(NodeId(4)).is_none());
    }
}
