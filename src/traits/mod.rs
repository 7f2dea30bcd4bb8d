//! Core traits for caffe-optimizer
//!
//! Defines the interface shared by graph rewrite passes.

use crate::error::CaffeResult;
use crate::graph::LayerGraph;

/// A rewrite pass over a layer graph
///
/// Passes are pure: they read one graph and build a new one, leaving the
/// input untouched.
///
/// # Example
///
/// ```ignore
/// struct DropDropout;
///
/// impl GraphPass for DropDropout {
///     fn name(&self) -> &'static str {
///         "DropDropout"
///     }
///
///     fn apply(&self, graph: &LayerGraph) -> CaffeResult<LayerGraph> {
///         let (header, nodes) = graph.clone().into_parts();
///         let nodes = nodes.into_iter().filter(|n| n.kind.as_type() != "Dropout");
///         LayerGraph::new(header, nodes.collect())
///     }
/// }
/// ```
pub trait GraphPass {
    /// Name of the pass
    fn name(&self) -> &'static str;

    /// Build the rewritten graph
    fn apply(&self, graph: &LayerGraph) -> CaffeResult<LayerGraph>;
}

/// Chainable pass that applies multiple passes in sequence
pub struct PassChain<'a> {
    passes: Vec<Box<dyn GraphPass + 'a>>,
}

impl<'a> PassChain<'a> {
    /// Create a new empty chain
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Add a pass to the chain
    #[allow(clippy::should_implement_trait)]
    pub fn add<P: GraphPass + 'a>(mut self, pass: P) -> Self {
        self.passes.push(Box::new(pass));
        self
    }

    /// Number of passes
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    /// Check if the chain has no passes
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

impl Default for PassChain<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphPass for PassChain<'_> {
    fn name(&self) -> &'static str {
        "PassChain"
    }

    fn apply(&self, graph: &LayerGraph) -> CaffeResult<LayerGraph> {
        let mut current = graph.clone();
        for pass in &self.passes {
            tracing::debug!(pass = pass.name(), layers = current.len(), "running pass");
            current = pass.apply(&current)?;
        }
        Ok(current)
    }
}
