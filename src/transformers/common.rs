//! Common types for transformers
//!
//! Statistics shared by the rewrite and weight-fusion steps.

/// Transformation result for statistics
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TransformResult {
    /// Number of chains matched
    pub patterns_matched: usize,
    /// Number of convolutions rewritten
    pub transforms_applied: usize,
    /// Number of layers eliminated
    pub nodes_eliminated: usize,
    /// Names of transformed and eliminated layers
    pub transformed_nodes: Vec<String>,
}

impl TransformResult {
    /// Create empty result
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful transformation
    pub fn record(&mut self, node_name: &str) {
        self.transforms_applied += 1;
        self.transformed_nodes.push(node_name.to_string());
    }

    /// Record elimination
    pub fn record_elimination(&mut self, node_name: &str) {
        self.nodes_eliminated += 1;
        self.transformed_nodes.push(node_name.to_string());
    }

    /// Check if anything changed
    pub fn is_empty(&self) -> bool {
        self.transforms_applied == 0 && self.nodes_eliminated == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_result() {
        let mut result = TransformResult::new();
        assert!(result.is_empty());

        result.record("conv1");
        result.record_elimination("bn1");

        assert_eq!(result.transforms_applied, 1);
        assert_eq!(result.nodes_eliminated, 1);
        assert_eq!(result.transformed_nodes, vec!["conv1", "bn1"]);
    }
}
