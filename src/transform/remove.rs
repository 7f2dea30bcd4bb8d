//! Fused layer removal pass
//!
//! Drops the folded BatchNorm and Scale layers and turns each fused
//! convolution into its `/mod` form.

use crate::error::CaffeResult;
use crate::graph::LayerGraph;
use crate::pattern::FusionRecord;
use crate::traits::GraphPass;

use super::fused_name;

/// Removes folded layers and renames fused convolutions
///
/// Walks the graph in reverse so a Scale is dropped before the BatchNorm it
/// reads from. Each fused convolution gets its bias enabled and both its
/// first output and its name set to `<conv>/mod`.
///
/// Expects the references of surviving layers to already point at the fused
/// names (see [`RetargetReferences`](super::RetargetReferences)); the result
/// is validated as a complete graph.
pub struct RemoveFusedLayers<'a> {
    record: &'a FusionRecord,
}

impl<'a> RemoveFusedLayers<'a> {
    /// Create the pass for a detected set of chains
    pub fn new(record: &'a FusionRecord) -> Self {
        Self { record }
    }
}

impl GraphPass for RemoveFusedLayers<'_> {
    fn name(&self) -> &'static str {
        "RemoveFusedLayers"
    }

    fn apply(&self, graph: &LayerGraph) -> CaffeResult<LayerGraph> {
        let mut kept = Vec::with_capacity(graph.len());

        for node in graph.nodes().iter().rev() {
            if let Some(conv) = self.record.conv_for(&node.name) {
                tracing::debug!(layer = %node.name, kind = %node.kind, conv, "removing folded layer");
                continue;
            }

            let mut node = node.clone();
            if self.record.is_fused_conv(&node.name) {
                let new_name = fused_name(&node.name);
                node.set_bias_term(true);
                if let Some(output) = node.outputs.first_mut() {
                    *output = new_name.clone();
                }
                tracing::debug!(from = %node.name, to = %new_name, "renaming fused convolution");
                node.name = new_name;
            }
            kept.push(node);
        }

        kept.reverse();
        LayerGraph::new(graph.header().clone(), kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::LayerKind;
    use crate::pattern::detect_chains;
    use crate::transform::RetargetReferences;

    #[test]
    fn test_remove_after_retarget() {
        let graph = LayerGraph::from_prototxt(
            r#"
input: "data"
layer { name: "conv1" type: "Convolution" bottom: "data" top: "conv1"
        convolution_param { num_output: 2 bias_term: false } }
layer { name: "bn1" type: "BatchNorm" bottom: "conv1" top: "bn1" }
layer { name: "scale1" type: "Scale" bottom: "bn1" top: "scale1" }
layer { name: "relu1" type: "ReLU" bottom: "scale1" top: "relu1" }
"#,
        )
        .unwrap();
        let record = detect_chains(&graph);

        let retargeted = RetargetReferences::new(&record).apply(&graph).unwrap();
        let fused = RemoveFusedLayers::new(&record).apply(&retargeted).unwrap();

        assert_eq!(fused.len(), 2);
        let conv = &fused.nodes()[0];
        assert_eq!(conv.name, "conv1/mod");
        assert_eq!(conv.outputs, vec!["conv1/mod"]);
        assert!(conv.bias_term());
        assert_eq!(fused.count_kind(&LayerKind::Normalization), 0);
        assert_eq!(fused.count_kind(&LayerKind::AffineScale), 0);
    }

    #[test]
    fn test_remove_alone_leaves_dangling_reference() {
        let graph = LayerGraph::from_prototxt(
            r#"
input: "data"
layer { name: "conv1" type: "Convolution" bottom: "data" top: "conv1" }
layer { name: "bn1" type: "BatchNorm" bottom: "conv1" top: "bn1" }
layer { name: "relu1" type: "ReLU" bottom: "bn1" top: "relu1" }
"#,
        )
        .unwrap();
        let record = detect_chains(&graph);

        assert!(RemoveFusedLayers::new(&record).apply(&graph).is_err());
    }
}
