//! Graph accessor methods
//!
//! Name lookups and producer/consumer traversal used by chain detection.

use super::layer_graph::LayerGraph;
use super::maps::BlobVersion;
use super::node::{LayerKind, LayerNode};

impl LayerGraph {
    // ========================================================================
    // Name lookups
    // ========================================================================

    /// Get a layer by name
    ///
    /// Absence is a normal outcome, not an error.
    pub fn find_by_name(&self, name: &str) -> Option<&LayerNode> {
        self.name_index.get(name).map(|&idx| &self.nodes()[idx])
    }

    /// Position of a layer
    pub fn position(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    /// Check if a layer exists
    pub fn has_node(&self, name: &str) -> bool {
        self.name_index.contains_key(name)
    }

    /// Check if any layer or net input uses the given blob name
    pub fn has_blob(&self, blob: &str) -> bool {
        self.net_inputs().iter().any(|b| b == blob)
            || self
                .nodes()
                .iter()
                .any(|n| n.inputs.iter().chain(&n.outputs).any(|b| b == blob))
    }

    /// Find layers of a kind
    pub fn find_nodes_by_kind(&self, kind: &LayerKind) -> Vec<&LayerNode> {
        self.nodes().iter().filter(|n| &n.kind == kind).collect()
    }

    /// Count layers of a kind
    pub fn count_kind(&self, kind: &LayerKind) -> usize {
        self.nodes().iter().filter(|n| &n.kind == kind).count()
    }

    // ========================================================================
    // Graph traversal
    // ========================================================================

    /// Position of the layer that wrote input `slot` of the layer at `idx`
    ///
    /// `None` for net-level inputs.
    pub fn producer_index(&self, idx: usize, slot: usize) -> Option<usize> {
        self.producer_map
            .get(idx)
            .and_then(|slots| slots.get(slot))
            .copied()
            .flatten()
    }

    /// The producer of a single-input layer, with its position
    ///
    /// `None` if the layer has zero or several inputs, or reads a net input.
    pub fn sole_producer(&self, idx: usize) -> Option<(usize, &LayerNode)> {
        let node = self.nodes().get(idx)?;
        if node.inputs.len() != 1 {
            return None;
        }
        let producer = self.producer_index(idx, 0)?;
        Some((producer, &self.nodes()[producer]))
    }

    /// Positions of the layers reading `blob` as written by the layer at
    /// `producer`
    pub fn consumers_of(&self, producer: usize, blob: &str) -> &[usize] {
        self.consumer_map
            .get(&BlobVersion {
                producer,
                blob: blob.to_string(),
            })
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    /// Check if the only reader of `blob` as written by `producer` is `consumer`
    pub fn is_sole_consumer(&self, producer: usize, blob: &str, consumer: usize) -> bool {
        self.consumers_of(producer, blob) == [consumer]
    }
}
