//! Graph map types and builders
//!
//! Defines the lookup structures behind [`LayerGraph`](super::LayerGraph).
//!
//! Caffe layers may write a blob they also read (in-place layers), so a blob
//! name alone does not identify a value. A value is a [`BlobVersion`]: the
//! blob name together with the layer that wrote it last.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{CaffeResult, TransformError};

use super::node::LayerNode;

/// A blob as written by one particular layer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobVersion {
    /// Index of the writing layer
    pub producer: usize,
    /// Blob name
    pub blob: String,
}

/// Type alias for the name index: layer name → position
pub type NameIndex = FxHashMap<String, usize>;

/// Type alias for producer map: per layer, per input slot, the writing layer
/// (`None` for net-level inputs and unresolved references)
pub type ProducerMap = Vec<SmallVec<[Option<usize>; 2]>>;

/// Type alias for consumer map: blob version → reading layers in order
/// SmallVec optimized for common case of 1-4 consumers
pub type ConsumerMap = FxHashMap<BlobVersion, SmallVec<[usize; 4]>>;

/// Build the name index, rejecting empty and duplicate names
pub fn build_name_index(nodes: &[LayerNode]) -> CaffeResult<NameIndex> {
    let mut map = FxHashMap::default();

    for (idx, node) in nodes.iter().enumerate() {
        if node.name.is_empty() {
            return Err(TransformError::MalformedGraph(format!(
                "layer at position {} has an empty name",
                idx
            )));
        }
        if let Some(prev) = map.insert(node.name.clone(), idx) {
            return Err(TransformError::MalformedGraph(format!(
                "duplicate layer name '{}' (positions {} and {})",
                node.name, prev, idx
            )));
        }
    }

    Ok(map)
}

/// Resolve every input reference to the layer that last wrote it
///
/// Returns the producer map together with the references that neither a
/// net-level input nor an earlier layer provides, as `(layer index, blob)`.
pub fn build_producer_map(
    nodes: &[LayerNode],
    net_inputs: &[String],
) -> (ProducerMap, Vec<(usize, String)>) {
    let mut latest: FxHashMap<&str, Option<usize>> = FxHashMap::default();
    for input in net_inputs {
        latest.insert(input.as_str(), None);
    }

    let mut producers = Vec::with_capacity(nodes.len());
    let mut unresolved = Vec::new();

    for (idx, node) in nodes.iter().enumerate() {
        let mut slots = SmallVec::new();
        for input in &node.inputs {
            match latest.get(input.as_str()) {
                Some(&producer) => slots.push(producer),
                None => {
                    slots.push(None);
                    unresolved.push((idx, input.clone()));
                }
            }
        }
        producers.push(slots);

        for output in &node.outputs {
            latest.insert(output.as_str(), Some(idx));
        }
    }

    (producers, unresolved)
}

/// Build consumer map from a producer map
///
/// Maps each blob version to the layers that read it.
pub fn build_consumer_map(nodes: &[LayerNode], producers: &ProducerMap) -> ConsumerMap {
    let mut map: ConsumerMap = FxHashMap::default();

    for (idx, (node, slots)) in nodes.iter().zip(producers).enumerate() {
        for (input, producer) in node.inputs.iter().zip(slots) {
            if let Some(producer) = *producer {
                let consumers = map
                    .entry(BlobVersion {
                        producer,
                        blob: input.clone(),
                    })
                    .or_default();
                // A layer reading the same blob twice counts once
                if consumers.last() != Some(&idx) {
                    consumers.push(idx);
                }
            }
        }
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::LayerKind;

    fn other(t: &str) -> LayerKind {
        LayerKind::Other(t.to_string())
    }

    fn make_in_place_nodes() -> Vec<LayerNode> {
        vec![
            LayerNode::new("conv1", LayerKind::Convolution)
                .with_inputs(&["data"])
                .with_outputs(&["conv1"]),
            LayerNode::new("bn1", LayerKind::Normalization)
                .with_inputs(&["conv1"])
                .with_outputs(&["conv1"]),
            LayerNode::new("relu1", other("ReLU"))
                .with_inputs(&["conv1"])
                .with_outputs(&["conv1"]),
            LayerNode::new("pool1", other("Pooling"))
                .with_inputs(&["conv1"])
                .with_outputs(&["pool1"]),
        ]
    }

    #[test]
    fn test_build_name_index() {
        let nodes = make_in_place_nodes();
        let index = build_name_index(&nodes).unwrap();
        assert_eq!(index.get("relu1"), Some(&2));
        assert!(index.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_name() {
        let mut nodes = make_in_place_nodes();
        nodes[3].name = "bn1".to_string();
        let err = build_name_index(&nodes).unwrap_err();
        assert!(err.to_string().contains("'bn1'"));
    }

    #[test]
    fn test_producer_map_follows_in_place_writes() {
        let nodes = make_in_place_nodes();
        let (producers, unresolved) = build_producer_map(&nodes, &["data".to_string()]);

        assert!(unresolved.is_empty());
        assert_eq!(producers[0].as_slice(), &[None::<usize>]); // net input
        assert_eq!(producers[1].as_slice(), &[Some(0usize)]); // conv1 as written by conv1
        assert_eq!(producers[2].as_slice(), &[Some(1usize)]); // conv1 as written by bn1
        assert_eq!(producers[3].as_slice(), &[Some(2usize)]); // conv1 as written by relu1
    }

    #[test]
    fn test_unresolved_reference() {
        let nodes = make_in_place_nodes();
        let (_, unresolved) = build_producer_map(&nodes, &[]);
        assert_eq!(unresolved, vec![(0, "data".to_string())]);
    }

    #[test]
    fn test_build_consumer_map() {
        let nodes = make_in_place_nodes();
        let (producers, _) = build_producer_map(&nodes, &["data".to_string()]);
        let consumers = build_consumer_map(&nodes, &producers);

        let version = BlobVersion {
            producer: 0,
            blob: "conv1".to_string(),
        };
        assert_eq!(consumers.get(&version).map(|c| c.as_slice()), Some(&[1][..]));

        let version = BlobVersion {
            producer: 2,
            blob: "conv1".to_string(),
        };
        assert_eq!(consumers.get(&version).map(|c| c.as_slice()), Some(&[3][..]));
    }
}
