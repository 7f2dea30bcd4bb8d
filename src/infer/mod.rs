//! Reference interpreter for Caffe networks
//!
//! A small NCHW forward pass used to compare a network with its fused
//! counterpart. It covers the layer types found in classification
//! deploy files:
//!
//! | Layer | Notes |
//! |-------|-------|
//! | Input | shape from `input_param`, `input_shape` or `input_dim` |
//! | Convolution | pad / stride / dilation / group, square or `_h`/`_w` |
//! | BatchNorm, Scale | inference statistics, one- or two-bottom Scale |
//! | ReLU, Softmax | negative slope, any axis |
//! | Pooling | MAX / AVE, global, Caffe ceil rounding |
//! | InnerProduct | axis, transpose |
//! | Eltwise, Concat, Flatten, Split, Dropout | |
//!
//! # Example
//!
//! ```ignore
//! use caffe_optimizer::infer::{EquivalenceChecker, EquivalenceConfig};
//!
//! let report = EquivalenceChecker::new(EquivalenceConfig::default().with_seed(7))
//!     .check(&graph, &store, &fused_graph, &fused_store)?;
//! assert!(report.matches());
//! ```

pub mod equivalence;
pub mod layers;

pub use equivalence::{EquivalenceChecker, EquivalenceConfig, EquivalenceReport};
pub use layers::forward_layer;

use indexmap::IndexMap;
use ndarray::ArrayD;
use rustc_hash::FxHashMap;

use crate::error::{CaffeResult, TransformError};
use crate::graph::{LayerGraph, LayerKind};
use crate::params::ParameterStore;
use crate::proto::TextMessage;

const INPUT: &str = "Input";

/// A network definition bound to its parameters
#[derive(Debug, Clone, Copy)]
pub struct Network<'a> {
    graph: &'a LayerGraph,
    params: &'a ParameterStore,
}

impl<'a> Network<'a> {
    /// Bind a graph to a parameter store
    pub fn new(graph: &'a LayerGraph, params: &'a ParameterStore) -> Self {
        Self { graph, params }
    }

    /// The bound graph
    pub fn graph(&self) -> &'a LayerGraph {
        self.graph
    }

    /// Run a forward pass
    ///
    /// `inputs` holds one array per net input or `Input` layer top. Returns
    /// the final value of every blob; [`net_outputs`] names the ones no
    /// layer reads.
    pub fn forward(
        &self,
        inputs: FxHashMap<String, ArrayD<f32>>,
    ) -> CaffeResult<FxHashMap<String, ArrayD<f32>>> {
        let mut values: FxHashMap<String, ArrayD<f32>> = FxHashMap::default();

        for name in self.graph.net_inputs() {
            let value = inputs.get(&name).ok_or_else(|| {
                TransformError::MissingParameter(format!("no value for net input '{}'", name))
            })?;
            values.insert(name, value.clone());
        }

        for node in self.graph.nodes() {
            if node.kind == LayerKind::Other(INPUT.to_string()) {
                for top in &node.outputs {
                    let value = inputs.get(top).ok_or_else(|| {
                        TransformError::MissingParameter(format!(
                            "no value for input layer top '{}'",
                            top
                        ))
                    })?;
                    values.insert(top.clone(), value.clone());
                }
                continue;
            }

            let outputs = {
                let bottoms = node
                    .inputs
                    .iter()
                    .map(|name| {
                        values.get(name).ok_or_else(|| {
                            TransformError::MalformedGraph(format!(
                                "layer '{}' reads '{}' before it is computed",
                                node.name, name
                            ))
                        })
                    })
                    .collect::<CaffeResult<Vec<_>>>()?;
                let blobs = self.params.get(&node.name).unwrap_or(&[]);
                forward_layer(node, &bottoms, blobs)?
            };

            if outputs.len() != node.outputs.len() {
                return Err(TransformError::InvalidLayer(format!(
                    "layer '{}' declares {} tops but produced {}",
                    node.name,
                    node.outputs.len(),
                    outputs.len()
                )));
            }
            tracing::trace!(layer = %node.name, "forward");

            for (top, value) in node.outputs.iter().zip(outputs) {
                values.insert(top.clone(), value);
            }
        }

        Ok(values)
    }
}

/// Blobs whose final version no layer reads, in the order they were last
/// written
pub fn net_outputs(graph: &LayerGraph) -> Vec<String> {
    let mut latest: IndexMap<&str, usize> = IndexMap::new();
    for (idx, node) in graph.nodes().iter().enumerate() {
        for output in &node.outputs {
            // Re-inserting keeps the first position; move it to the back
            latest.shift_remove(output.as_str());
            latest.insert(output.as_str(), idx);
        }
    }

    latest
        .into_iter()
        .filter(|(blob, producer)| graph.consumers_of(*producer, blob).is_empty())
        .map(|(blob, _)| blob.to_string())
        .collect()
}

/// Shape of every network input, keyed by blob name
///
/// Net-level inputs take their shape from `input_shape` (one per input) or
/// from `input_dim` (four values per input). `Input` layers use
/// `input_param { shape { dim: ... } }`, one shape per top or a single shape
/// shared by all tops.
pub fn input_shapes(graph: &LayerGraph) -> CaffeResult<IndexMap<String, Vec<usize>>> {
    let mut shapes = IndexMap::new();
    let header = graph.header();
    let names = graph.net_inputs();

    if !names.is_empty() {
        let declared: Vec<Vec<usize>> = header
            .get_all("input_shape")
            .filter_map(|v| v.as_message())
            .map(shape_dims)
            .collect();
        let legacy: Vec<usize> = header.get_parsed_all("input_dim");

        for (i, name) in names.iter().enumerate() {
            let shape = match declared.get(i) {
                Some(shape) => shape.clone(),
                None if legacy.len() >= (i + 1) * 4 => legacy[i * 4..(i + 1) * 4].to_vec(),
                None => {
                    return Err(TransformError::MissingParameter(format!(
                        "no shape declared for net input '{}'",
                        name
                    )))
                }
            };
            shapes.insert(name.clone(), shape);
        }
    }

    for node in graph.nodes() {
        if node.kind != LayerKind::Other(INPUT.to_string()) {
            continue;
        }
        let declared: Vec<Vec<usize>> = node
            .params
            .get_message("input_param")
            .map(|p| {
                p.get_all("shape")
                    .filter_map(|v| v.as_message())
                    .map(shape_dims)
                    .collect()
            })
            .unwrap_or_default();

        for (i, top) in node.outputs.iter().enumerate() {
            let shape = declared
                .get(i)
                .or_else(|| if declared.len() == 1 { declared.first() } else { None })
                .ok_or_else(|| {
                    TransformError::MissingParameter(format!(
                        "input layer '{}' declares no shape for '{}'",
                        node.name, top
                    ))
                })?;
            shapes.insert(top.clone(), shape.clone());
        }
    }

    Ok(shapes)
}

fn shape_dims(shape: &TextMessage) -> Vec<usize> {
    shape.get_parsed_all("dim")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::vec_to_array;
    use ndarray::IxDyn;

    const NET: &str = r#"
name: "tiny"
layer { name: "data" type: "Input" top: "data" input_param { shape { dim: 1 dim: 1 dim: 2 dim: 2 } } }
layer { name: "conv" type: "Convolution" bottom: "data" top: "conv"
        convolution_param { num_output: 2 kernel_size: 1 } }
layer { name: "relu" type: "ReLU" bottom: "conv" top: "conv" }
layer { name: "pool" type: "Pooling" bottom: "conv" top: "pool"
        pooling_param { pool: AVE global_pooling: true } }
layer { name: "prob" type: "Softmax" bottom: "pool" top: "prob" }
"#;

    fn make_store() -> ParameterStore {
        let mut store = ParameterStore::new();
        store.insert(
            "conv",
            vec![
                ArrayD::from_shape_vec(IxDyn(&[2, 1, 1, 1]), vec![1.0, -1.0]).unwrap(),
                vec_to_array(&[0.0, 1.0]),
            ],
        );
        store
    }

    #[test]
    fn test_input_shapes_from_layer() {
        let graph = LayerGraph::from_prototxt(NET).unwrap();
        let shapes = input_shapes(&graph).unwrap();
        assert_eq!(shapes["data"], vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_input_shapes_from_header() {
        let graph = LayerGraph::from_prototxt(
            r#"
input: "a"
input_shape { dim: 1 dim: 3 dim: 8 dim: 8 }
input: "b"
input_shape { dim: 1 dim: 1 }
layer { name: "cat" type: "Concat" bottom: "a" bottom: "a" top: "cat" }
"#,
        )
        .unwrap();
        let shapes = input_shapes(&graph).unwrap();
        assert_eq!(shapes["a"], vec![1, 3, 8, 8]);
        assert_eq!(shapes["b"], vec![1, 1]);

        let legacy = LayerGraph::from_prototxt(
            r#"
input: "data"
input_dim: 1 input_dim: 3 input_dim: 224 input_dim: 224
layer { name: "relu" type: "ReLU" bottom: "data" top: "data" }
"#,
        )
        .unwrap();
        assert_eq!(input_shapes(&legacy).unwrap()["data"], vec![1, 3, 224, 224]);
    }

    #[test]
    fn test_missing_input_shape() {
        let graph = LayerGraph::from_prototxt(
            r#"
input: "data"
layer { name: "relu" type: "ReLU" bottom: "data" top: "relu" }
"#,
        )
        .unwrap();
        assert!(matches!(
            input_shapes(&graph),
            Err(TransformError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_net_outputs() {
        let graph = LayerGraph::from_prototxt(NET).unwrap();
        assert_eq!(net_outputs(&graph), vec!["prob"]);

        let branched = LayerGraph::from_prototxt(
            r#"
input: "data"
layer { name: "a" type: "ReLU" bottom: "data" top: "a" }
layer { name: "b" type: "ReLU" bottom: "data" top: "b" }
layer { name: "a2" type: "ReLU" bottom: "a" top: "a" }
"#,
        )
        .unwrap();
        assert_eq!(net_outputs(&branched), vec!["b", "a"]);
    }

    #[test]
    fn test_forward() {
        let graph = LayerGraph::from_prototxt(NET).unwrap();
        let store = make_store();

        let mut inputs = FxHashMap::default();
        inputs.insert(
            "data".to_string(),
            ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
        );

        let outputs = Network::new(&graph, &store).forward(inputs).unwrap();
        let prob = &outputs["prob"];
        assert_eq!(prob.shape(), &[1, 2, 1, 1]);
        // channel 0 averages 2.5, channel 1 is non-positive before the ReLU
        assert!(prob[[0, 0, 0, 0]] > prob[[0, 1, 0, 0]]);
        assert!((prob.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_forward_missing_input() {
        let graph = LayerGraph::from_prototxt(NET).unwrap();
        let store = make_store();
        let result = Network::new(&graph, &store).forward(FxHashMap::default());
        assert!(matches!(result, Err(TransformError::MissingParameter(_))));
    }
}
