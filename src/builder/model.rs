//! Model builder for Caffe parameter stores
//!
//! Assembles the parameter store of a rewritten network from the original
//! parameters and the fused convolution blobs.

use indexmap::IndexMap;
use ndarray::ArrayD;

use crate::error::{CaffeResult, TransformError};
use crate::graph::LayerGraph;
use crate::params::ParameterStore;

/// Model builder for constructing fused parameter stores
#[derive(Debug)]
pub struct ModelBuilder<'a> {
    /// Rewritten graph
    graph: &'a LayerGraph,
    /// Original parameters
    source: Option<&'a ParameterStore>,
    /// New blobs keyed by layer name
    fused: IndexMap<String, Vec<ArrayD<f32>>>,
}

impl<'a> ModelBuilder<'a> {
    /// Create a new builder for a rewritten graph
    pub fn new(graph: &'a LayerGraph) -> Self {
        Self {
            graph,
            source: None,
            fused: IndexMap::new(),
        }
    }

    /// Set the store unchanged layers are copied from
    pub fn with_source(mut self, store: &'a ParameterStore) -> Self {
        self.source = Some(store);
        self
    }

    /// Set the fused blobs
    pub fn with_fused(mut self, fused: IndexMap<String, Vec<ArrayD<f32>>>) -> Self {
        self.fused = fused;
        self
    }

    /// Build the parameter store
    ///
    /// Every graph layer takes its fused blobs if it has any, otherwise the
    /// blobs stored under its name in the source.
    pub fn build_store(&self) -> CaffeResult<ParameterStore> {
        if let Some(name) = self.fused.keys().find(|n| !self.graph.has_node(n)) {
            return Err(TransformError::Internal(format!(
                "fused blobs for '{}', which is not in the rewritten graph",
                name
            )));
        }

        let mut store = ParameterStore::new();
        let mut carried = 0;

        for node in self.graph.nodes() {
            if let Some(blobs) = self.fused.get(&node.name) {
                store.insert(&node.name, blobs.clone());
            } else if let Some(blobs) = self.source.and_then(|s| s.get(&node.name)) {
                store.insert(&node.name, blobs.to_vec());
                carried += 1;
            }
        }

        tracing::debug!(fused = self.fused.len(), carried, "assembled parameter store");
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::vec_to_array;

    fn make_graph() -> LayerGraph {
        LayerGraph::from_prototxt(
            r#"
name: "fused"
input: "data"
layer { name: "conv1/mod" type: "Convolution" bottom: "data" top: "conv1/mod" }
layer { name: "fc" type: "InnerProduct" bottom: "conv1/mod" top: "fc" }
layer { name: "prob" type: "Softmax" bottom: "fc" top: "prob" }
"#,
        )
        .unwrap()
    }

    fn make_source() -> ParameterStore {
        let mut store = ParameterStore::new();
        store.insert("conv1", vec![vec_to_array(&[1.0])]);
        store.insert("bn1", vec![vec_to_array(&[0.0])]);
        store.insert("fc", vec![vec_to_array(&[2.0]), vec_to_array(&[3.0])]);
        store
    }

    #[test]
    fn test_model_builder() {
        let graph = make_graph();
        let source = make_source();
        let mut fused = IndexMap::new();
        fused.insert(
            "conv1/mod".to_string(),
            vec![vec_to_array(&[0.5]), vec_to_array(&[0.25])],
        );

        let store = ModelBuilder::new(&graph)
            .with_source(&source)
            .with_fused(fused)
            .build_store()
            .unwrap();

        assert_eq!(store.layer_names().collect::<Vec<_>>(), vec!["conv1/mod", "fc"]);
        assert_eq!(store.get("conv1/mod").unwrap().len(), 2);
        assert_eq!(store.get("fc").unwrap(), source.get("fc").unwrap());
        assert!(!store.contains("bn1"));
    }

    #[test]
    fn test_unknown_fused_layer() {
        let graph = make_graph();
        let mut fused = IndexMap::new();
        fused.insert("conv9/mod".to_string(), vec![vec_to_array(&[0.5])]);

        let result = ModelBuilder::new(&graph).with_fused(fused).build_store();
        assert!(matches!(result, Err(TransformError::Internal(_))));
    }
}
