//! Reference retargeting pass
//!
//! Points every surviving reference to a fused chain at the name its
//! convolution will carry after fusion. Runs before any layer is removed, so
//! the layers still appear exactly as detection saw them.

use rustc_hash::FxHashMap;

use crate::error::CaffeResult;
use crate::graph::LayerGraph;
use crate::pattern::FusionRecord;
use crate::traits::GraphPass;

use super::fused_name;

/// Rewrites references to fused chains to `<conv>/mod`
///
/// Walks the graph forward keeping an alias table from blob name to fused
/// name. A fused convolution and the layers folded into it add their outputs
/// to the table; every other layer has its inputs mapped through it. An
/// in-place layer keeps writing the blob it reads, so its outputs are mapped
/// too, while a fresh write under an aliased name ends the alias.
///
/// Fused convolutions themselves keep their names; the removal pass renames
/// them.
pub struct RetargetReferences<'a> {
    record: &'a FusionRecord,
}

impl<'a> RetargetReferences<'a> {
    /// Create the pass for a detected set of chains
    pub fn new(record: &'a FusionRecord) -> Self {
        Self { record }
    }
}

impl GraphPass for RetargetReferences<'_> {
    fn name(&self) -> &'static str {
        "RetargetReferences"
    }

    fn apply(&self, graph: &LayerGraph) -> CaffeResult<LayerGraph> {
        let mut alias: FxHashMap<String, String> = FxHashMap::default();
        let mut nodes = Vec::with_capacity(graph.len());

        for node in graph.nodes() {
            if let Some(conv) = self.record.conv_for(&node.name) {
                let target = fused_name(conv);
                for output in &node.outputs {
                    alias.insert(output.clone(), target.clone());
                }
                nodes.push(node.clone());
                continue;
            }

            let mut node = node.clone();
            let original_inputs = node.inputs.clone();

            for input in &mut node.inputs {
                if let Some(target) = alias.get(input.as_str()) {
                    *input = target.clone();
                }
            }

            if self.record.is_fused_conv(&node.name) {
                let target = fused_name(&node.name);
                for output in &node.outputs {
                    alias.insert(output.clone(), target.clone());
                }
                nodes.push(node);
                continue;
            }

            for output in &mut node.outputs {
                if original_inputs.contains(output) {
                    if let Some(target) = alias.get(output.as_str()) {
                        *output = target.clone();
                    }
                } else {
                    alias.remove(output.as_str());
                }
            }

            nodes.push(node);
        }

        // References now point at names that appear only after removal
        LayerGraph::assemble(graph.header().clone(), nodes)
    }
}
