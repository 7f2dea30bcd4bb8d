//! Layer graph for Caffe network manipulation
//!
//! `LayerGraph` is the central structure for working with a network
//! definition. It keeps the ordered layer list together with the lookups the
//! fusion passes need.

use crate::error::{CaffeResult, TransformError};
use crate::proto::{text, TextMessage, TextValue};

use super::maps::{
    build_consumer_map, build_name_index, build_producer_map, ConsumerMap, NameIndex, ProducerMap,
};
use super::node::LayerNode;

/// Ordered layer list with name, producer and consumer lookups
///
/// Graphs are immutable: rewrite passes build new graphs from the nodes of
/// an existing one.
#[derive(Debug, Clone)]
pub struct LayerGraph {
    /// Net-level fields other than `layer` (`name`, `input`, `input_shape`, ...)
    header: TextMessage,
    /// Layers in definition order
    nodes: Vec<LayerNode>,
    /// Maps layer name → position
    pub(super) name_index: NameIndex,
    /// Per layer, per input slot: the layer that last wrote that blob
    pub(super) producer_map: ProducerMap,
    /// Maps blob version → reading layers
    pub(super) consumer_map: ConsumerMap,
}

impl LayerGraph {
    /// Create a graph, validating names and references
    ///
    /// Fails with [`TransformError::MalformedGraph`] if two layers share a
    /// name, a layer has an empty name, or an input reference is neither a
    /// net-level input nor an output of an earlier layer.
    pub fn new(header: TextMessage, nodes: Vec<LayerNode>) -> CaffeResult<Self> {
        let (graph, unresolved) = Self::build(header, nodes)?;

        if let Some((idx, blob)) = unresolved.first() {
            return Err(TransformError::MalformedGraph(format!(
                "layer '{}' reads '{}', which no earlier layer or net input provides",
                graph.nodes[*idx].name, blob
            )));
        }

        Ok(graph)
    }

    /// Create a graph checking only name uniqueness
    ///
    /// Used for the intermediate graph between rewrite passes, whose
    /// references point at names that only exist once the last pass ran.
    pub(crate) fn assemble(header: TextMessage, nodes: Vec<LayerNode>) -> CaffeResult<Self> {
        Self::build(header, nodes).map(|(graph, _)| graph)
    }

    fn build(
        header: TextMessage,
        nodes: Vec<LayerNode>,
    ) -> CaffeResult<(Self, Vec<(usize, String)>)> {
        let name_index = build_name_index(&nodes)?;
        let net_inputs = header.get_strs("input");
        let (producer_map, unresolved) = build_producer_map(&nodes, &net_inputs);
        let consumer_map = build_consumer_map(&nodes, &producer_map);

        let graph = Self {
            header,
            nodes,
            name_index,
            producer_map,
            consumer_map,
        };
        Ok((graph, unresolved))
    }

    /// Create from a parsed `NetParameter` text message
    pub fn from_message(net: &TextMessage) -> CaffeResult<Self> {
        let mut header = TextMessage::new();
        let mut nodes = Vec::new();

        for (name, value) in net.fields() {
            match (name, value) {
                ("layer", TextValue::Message(layer)) => nodes.push(LayerNode::from_message(layer)?),
                ("layers", _) => {
                    return Err(TransformError::MalformedGraph(
                        "legacy V1 'layers' definitions are not supported; upgrade the prototxt"
                            .to_string(),
                    ))
                }
                _ => header.push(name, value.clone()),
            }
        }

        Self::new(header, nodes)
    }

    /// Parse prototxt text
    pub fn from_prototxt(source: &str) -> CaffeResult<Self> {
        Self::from_message(&text::parse(source)?)
    }

    /// Convert back to a `NetParameter` text message
    pub fn to_message(&self) -> TextMessage {
        let mut msg = self.header.clone();
        for node in &self.nodes {
            msg.push("layer", TextValue::Message(node.to_message()));
        }
        msg
    }

    /// Render as prototxt text
    pub fn to_prototxt(&self) -> String {
        self.to_message().to_string()
    }

    // ========================================================================
    // Plain accessors
    // ========================================================================

    /// Net-level fields
    pub fn header(&self) -> &TextMessage {
        &self.header
    }

    /// Network name, if declared
    pub fn name(&self) -> Option<&str> {
        self.header.get_str("name")
    }

    /// Net-level `input` blobs
    pub fn net_inputs(&self) -> Vec<String> {
        self.header.get_strs("input")
    }

    /// Layers in order
    pub fn nodes(&self) -> &[LayerNode] {
        &self.nodes
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the graph has no layers
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Split into header and layers
    pub fn into_parts(self) -> (TextMessage, Vec<LayerNode>) {
        (self.header, self.nodes)
    }
}

impl PartialEq for LayerGraph {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.nodes == other.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::LayerKind;

    const NET: &str = r#"
name: "tiny"
input: "data"
input_shape { dim: 1 dim: 3 dim: 8 dim: 8 }
layer { name: "conv1" type: "Convolution" bottom: "data" top: "conv1"
        convolution_param { num_output: 2 kernel_size: 3 bias_term: false } }
layer { name: "bn1" type: "BatchNorm" bottom: "conv1" top: "bn1" }
layer { name: "scale1" type: "Scale" bottom: "bn1" top: "scale1"
        scale_param { bias_term: true } }
layer { name: "relu1" type: "ReLU" bottom: "scale1" top: "scale1" }
"#;

    #[test]
    fn test_from_prototxt() {
        let graph = LayerGraph::from_prototxt(NET).unwrap();

        assert_eq!(graph.name(), Some("tiny"));
        assert_eq!(graph.net_inputs(), vec!["data"]);
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.nodes()[1].kind, LayerKind::Normalization);
        assert_eq!(graph.nodes()[3].kind, LayerKind::Other("ReLU".to_string()));
    }

    #[test]
    fn test_prototxt_round_trip() {
        let graph = LayerGraph::from_prototxt(NET).unwrap();
        let again = LayerGraph::from_prototxt(&graph.to_prototxt()).unwrap();
        assert_eq!(graph, again);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let source = NET.replace("name: \"scale1\"", "name: \"bn1\"");
        let err = LayerGraph::from_prototxt(&source).unwrap_err();
        assert!(matches!(err, TransformError::MalformedGraph(_)));
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let source = NET.replace("bottom: \"bn1\"", "bottom: \"nowhere\"");
        let err = LayerGraph::from_prototxt(&source).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_input_layer_provides_root() {
        let source = r#"
layer { name: "data" type: "Input" top: "data"
        input_param { shape { dim: 1 dim: 3 dim: 4 dim: 4 } } }
layer { name: "relu" type: "ReLU" bottom: "data" top: "out" }
"#;
        let graph = LayerGraph::from_prototxt(source).unwrap();
        assert!(graph.net_inputs().is_empty());
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_legacy_layers_rejected() {
        let source = r#"layers { name: "conv1" type: CONVOLUTION }"#;
        assert!(LayerGraph::from_prototxt(source).is_err());
    }
}
