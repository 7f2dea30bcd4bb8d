//! Convolution chain detection
//!
//! Recognizes `Convolution → BatchNorm → Scale` chains, with either suffix
//! optionally absent, and records which layers fold into which convolution.
//!
//! Matching runs backwards from the suffix layer, the same direction the
//! chain is written in: a Scale must sit on a BatchNorm, and a BatchNorm on
//! a Convolution.
//!
//! A link only counts when the suffix layer is the sole reader of the value
//! its producer wrote. Folding a BatchNorm into a convolution whose output is
//! also read elsewhere would change what those other readers see.

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::graph::{LayerGraph, LayerKind, LayerNode};

/// Finds the convolution a Normalization or AffineScale layer folds into
pub struct ChainDetector<'a> {
    graph: &'a LayerGraph,
}

impl<'a> ChainDetector<'a> {
    /// Create a detector over a graph
    pub fn new(graph: &'a LayerGraph) -> Self {
        Self { graph }
    }

    /// Name of the convolution the layer folds into
    ///
    /// - Scale: its producer must be a BatchNorm that itself folds into a
    ///   convolution.
    /// - BatchNorm: its producer must be a Convolution.
    /// - Anything else, or a name not in the graph: `None`.
    pub fn fusable_conv(&self, layer_name: &str) -> Option<&'a str> {
        let idx = self.graph.position(layer_name)?;
        let node = &self.graph.nodes()[idx];

        match node.kind {
            LayerKind::AffineScale => {
                if !is_channel_scale(node) {
                    return None;
                }
                let (bn_idx, bn) = self.graph.sole_producer(idx)?;
                if bn.kind != LayerKind::Normalization
                    || !self.graph.is_sole_consumer(bn_idx, &node.inputs[0], idx)
                {
                    return None;
                }
                self.conv_behind_normalization(bn_idx)
            }
            LayerKind::Normalization => self.conv_behind_normalization(idx),
            _ => None,
        }
    }

    fn conv_behind_normalization(&self, bn_idx: usize) -> Option<&'a str> {
        let bn = &self.graph.nodes()[bn_idx];
        if bn.outputs.len() != 1 {
            return None;
        }

        let (conv_idx, conv) = self.graph.sole_producer(bn_idx)?;
        if conv.kind != LayerKind::Convolution || conv.outputs.len() != 1 {
            return None;
        }
        if !self.graph.is_sole_consumer(conv_idx, &bn.inputs[0], bn_idx) {
            return None;
        }

        Some(conv.name.as_str())
    }
}

/// Name of the convolution the layer at `layer_name` folds into
pub fn detect_fusable_conv<'a>(graph: &'a LayerGraph, layer_name: &str) -> Option<&'a str> {
    ChainDetector::new(graph).fusable_conv(layer_name)
}

/// A Scale only folds when it applies one factor per channel from a learned
/// blob: a single input and output, `axis: 1`, `num_axes: 1`.
fn is_channel_scale(node: &LayerNode) -> bool {
    if node.inputs.len() != 1 || node.outputs.len() != 1 {
        return false;
    }
    let param = node.kind_param();
    let axis = param.and_then(|p| p.get_parsed::<i32>("axis")).unwrap_or(1);
    let num_axes = param
        .and_then(|p| p.get_parsed::<i32>("num_axes"))
        .unwrap_or(1);
    axis == 1 && num_axes == 1
}

/// Which Normalization and AffineScale layers fold into which convolution
///
/// Keyed by the convolution's original name, in graph order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusionRecord {
    normalization: IndexMap<String, String>,
    affine_scale: IndexMap<String, String>,
    owners: FxHashMap<String, String>,
}

impl FusionRecord {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a Normalization layer folding into `conv`
    pub fn insert_normalization(&mut self, conv: &str, layer: &str) {
        self.normalization.insert(conv.to_string(), layer.to_string());
        self.owners.insert(layer.to_string(), conv.to_string());
    }

    /// Record an AffineScale layer folding into `conv`
    pub fn insert_affine_scale(&mut self, conv: &str, layer: &str) {
        self.affine_scale.insert(conv.to_string(), layer.to_string());
        self.owners.insert(layer.to_string(), conv.to_string());
    }

    /// Fused convolutions in graph order
    pub fn fused_convolutions(&self) -> impl Iterator<Item = &str> {
        self.normalization.keys().map(|s| s.as_str())
    }

    /// Check if a convolution takes part in a fusion
    pub fn is_fused_conv(&self, conv: &str) -> bool {
        self.normalization.contains_key(conv)
    }

    /// The Normalization layer folded into `conv`
    pub fn normalization_for(&self, conv: &str) -> Option<&str> {
        self.normalization.get(conv).map(|s| s.as_str())
    }

    /// The AffineScale layer folded into `conv`, if any
    pub fn affine_scale_for(&self, conv: &str) -> Option<&str> {
        self.affine_scale.get(conv).map(|s| s.as_str())
    }

    /// Check if a Normalization or AffineScale layer is folded away
    pub fn is_fused_layer(&self, layer: &str) -> bool {
        self.owners.contains_key(layer)
    }

    /// The convolution a folded layer belongs to
    pub fn conv_for(&self, layer: &str) -> Option<&str> {
        self.owners.get(layer).map(|s| s.as_str())
    }

    /// Number of fused chains
    pub fn len(&self) -> usize {
        self.normalization.len()
    }

    /// Check if nothing is fused
    pub fn is_empty(&self) -> bool {
        self.normalization.is_empty()
    }

    /// Number of layers folded away
    pub fn removed_count(&self) -> usize {
        self.owners.len()
    }
}

/// Detect every fusable chain of the graph
///
/// Runs on the unmodified graph, before any rewrite, so every lookup sees
/// the chains as written.
pub fn detect_chains(graph: &LayerGraph) -> FusionRecord {
    let detector = ChainDetector::new(graph);
    let mut record = FusionRecord::new();

    for node in graph.nodes() {
        let Some(conv) = detector.fusable_conv(&node.name) else {
            continue;
        };
        match node.kind {
            LayerKind::Normalization => record.insert_normalization(conv, &node.name),
            LayerKind::AffineScale => record.insert_affine_scale(conv, &node.name),
            _ => {}
        }
    }

    record
}
