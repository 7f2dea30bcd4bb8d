//! Topology rewriting
//!
//! Detects the fusable chains of a graph and rebuilds it without them.

use crate::error::{CaffeResult, TransformError};
use crate::graph::LayerGraph;
use crate::pattern::{detect_chains, FusionRecord};
use crate::traits::{GraphPass, PassChain};
use crate::transformers::TransformResult;

use super::{fused_name, RemoveFusedLayers, RetargetReferences};

/// Result of a topology rewrite
#[derive(Debug, Clone)]
pub struct RewriteOutput {
    /// The rewritten graph
    pub graph: LayerGraph,
    /// Which layers were folded into which convolution
    pub record: FusionRecord,
    /// Statistics
    pub result: TransformResult,
}

/// Rewrites a graph so each fusable chain becomes one convolution
///
/// Detection runs once on the input graph; the retargeting and removal
/// passes then build the output from that record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TopologyRewriter;

impl TopologyRewriter {
    /// Create a rewriter
    pub fn new() -> Self {
        Self
    }

    /// Rewrite the graph
    ///
    /// Fails with [`TransformError::MalformedGraph`] if a fused name would
    /// clash with an existing layer or blob. A graph without chains comes
    /// back unchanged.
    pub fn rewrite(&self, graph: &LayerGraph) -> CaffeResult<RewriteOutput> {
        let record = detect_chains(graph);

        if record.is_empty() {
            tracing::info!("no fusable convolution chains found");
            return Ok(RewriteOutput {
                graph: graph.clone(),
                record,
                result: TransformResult::new(),
            });
        }

        check_fused_names(graph, &record)?;

        let rewritten = {
            let passes = PassChain::new()
                .add(RetargetReferences::new(&record))
                .add(RemoveFusedLayers::new(&record));
            passes.apply(graph)?
        };

        let mut result = TransformResult::new();
        result.patterns_matched = record.len();
        for conv in record.fused_convolutions() {
            result.record(conv);
            for layer in [record.normalization_for(conv), record.affine_scale_for(conv)]
                .into_iter()
                .flatten()
            {
                result.record_elimination(layer);
            }
        }

        tracing::info!(
            chains = record.len(),
            removed = record.removed_count(),
            layers_before = graph.len(),
            layers_after = rewritten.len(),
            "rewrote network topology"
        );

        Ok(RewriteOutput {
            graph: rewritten,
            record,
            result,
        })
    }
}

fn check_fused_names(graph: &LayerGraph, record: &FusionRecord) -> CaffeResult<()> {
    for conv in record.fused_convolutions() {
        let name = fused_name(conv);
        if graph.has_node(&name) || graph.has_blob(&name) {
            return Err(TransformError::MalformedGraph(format!(
                "cannot fuse '{}': the name '{}' is already in use",
                conv, name
            )));
        }
    }
    Ok(())
}
