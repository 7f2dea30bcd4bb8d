//! Layer parameter store
//!
//! Holds the learned blobs of a network keyed by layer name, converted to
//! `ndarray` tensors. This is the in-memory form of a `.caffemodel`.
//!
//! # Example
//!
//! ```ignore
//! use caffe_optimizer::params::ParameterStore;
//!
//! let store = ParameterStore::from_net_parameter(&net)?;
//! if let Some(blobs) = store.get("conv1") {
//!     println!("conv1 weight shape: {:?}", blobs[0].shape());
//! }
//! ```

use indexmap::IndexMap;
use ndarray::ArrayD;

use crate::error::CaffeResult;
use crate::graph::LayerGraph;
use crate::proto::{LayerParameter, NetParameter};
use crate::tensor::{array_to_blob, blob_to_array};

/// Learned blobs per layer, in file order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterStore {
    blobs: IndexMap<String, Vec<ArrayD<f32>>>,
}

impl ParameterStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a decoded `.caffemodel`
    ///
    /// Layers without blobs are skipped. If a name appears twice the later
    /// layer wins.
    pub fn from_net_parameter(net: &NetParameter) -> CaffeResult<Self> {
        let mut store = Self::new();

        for layer in net.layer.iter().filter(|l| !l.blobs.is_empty()) {
            let arrays = layer
                .blobs
                .iter()
                .map(blob_to_array)
                .collect::<CaffeResult<Vec<_>>>()?;

            if store.blobs.insert(layer.name.clone(), arrays).is_some() {
                tracing::warn!(layer = %layer.name, "duplicate layer in parameter store, keeping the last");
            }
        }

        Ok(store)
    }

    /// Build a `.caffemodel` message for a graph
    ///
    /// Emits one layer per graph node, in graph order, with the blobs stored
    /// under that node's name.
    pub fn to_net_parameter(&self, graph: &LayerGraph) -> NetParameter {
        let layer = graph
            .nodes()
            .iter()
            .map(|node| LayerParameter {
                name: node.name.clone(),
                r#type: node.kind.as_type().to_string(),
                bottom: node.inputs.clone(),
                top: node.outputs.clone(),
                blobs: self
                    .get(&node.name)
                    .map(|arrays| arrays.iter().map(array_to_blob).collect())
                    .unwrap_or_default(),
            })
            .collect();

        NetParameter {
            name: graph.name().unwrap_or_default().to_string(),
            input: graph.net_inputs(),
            layer,
            ..Default::default()
        }
    }

    /// Blobs of a layer
    pub fn get(&self, layer: &str) -> Option<&[ArrayD<f32>]> {
        self.blobs.get(layer).map(|b| b.as_slice())
    }

    /// Set the blobs of a layer, returning the previous ones
    pub fn insert(&mut self, layer: &str, blobs: Vec<ArrayD<f32>>) -> Option<Vec<ArrayD<f32>>> {
        self.blobs.insert(layer.to_string(), blobs)
    }

    /// Check if a layer has blobs
    pub fn contains(&self, layer: &str) -> bool {
        self.blobs.contains_key(layer)
    }

    /// Layer names in order
    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.blobs.keys().map(|s| s.as_str())
    }

    /// Number of layers with blobs
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Total number of stored values
    pub fn total_values(&self) -> usize {
        self.blobs.values().flatten().map(|a| a.len()).sum()
    }
}
