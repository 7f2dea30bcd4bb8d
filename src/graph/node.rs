//! Layer nodes
//!
//! A [`LayerNode`] is one `layer { ... }` entry of a network definition with
//! its connectivity pulled out into typed fields. Everything else the layer
//! declares stays in [`LayerNode::params`] so it is written back unchanged.

use std::fmt;

use crate::error::{CaffeResult, TransformError};
use crate::proto::{TextMessage, TextValue};

/// Caffe type string of a convolution layer
pub const CONVOLUTION: &str = "Convolution";
/// Caffe type string of a batch normalization layer
pub const BATCH_NORM: &str = "BatchNorm";
/// Caffe type string of a per-channel scale layer
pub const SCALE: &str = "Scale";

/// Layer kind, closed over the kinds the fusion cares about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LayerKind {
    /// `Convolution`
    Convolution,
    /// `BatchNorm`
    Normalization,
    /// `Scale`
    AffineScale,
    /// Any other layer type, by its Caffe type string
    Other(String),
}

impl LayerKind {
    /// Map a Caffe type string to a kind
    pub fn from_type(layer_type: &str) -> Self {
        match layer_type {
            CONVOLUTION => LayerKind::Convolution,
            BATCH_NORM => LayerKind::Normalization,
            SCALE => LayerKind::AffineScale,
            other => LayerKind::Other(other.to_string()),
        }
    }

    /// Caffe type string
    pub fn as_type(&self) -> &str {
        match self {
            LayerKind::Convolution => CONVOLUTION,
            LayerKind::Normalization => BATCH_NORM,
            LayerKind::AffineScale => SCALE,
            LayerKind::Other(t) => t,
        }
    }

    /// Normalization or AffineScale
    pub fn is_fusable_suffix(&self) -> bool {
        matches!(self, LayerKind::Normalization | LayerKind::AffineScale)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_type())
    }
}

/// A layer of the network
#[derive(Debug, Clone, PartialEq)]
pub struct LayerNode {
    /// Unique layer name
    pub name: String,
    /// Layer kind
    pub kind: LayerKind,
    /// `bottom` blob names
    pub inputs: Vec<String>,
    /// `top` blob names
    pub outputs: Vec<String>,
    /// Remaining layer fields (`convolution_param`, `param`, ...)
    pub params: TextMessage,
}

impl LayerNode {
    /// Create a node without connections or parameters
    pub fn new(name: &str, kind: LayerKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: TextMessage::new(),
        }
    }

    /// Set the `bottom` blobs
    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the `top` blobs
    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the remaining layer fields
    pub fn with_params(mut self, params: TextMessage) -> Self {
        self.params = params;
        self
    }

    /// Build a node from a `layer { ... }` message
    pub fn from_message(msg: &TextMessage) -> CaffeResult<Self> {
        let name = msg
            .get_str("name")
            .ok_or_else(|| TransformError::MalformedGraph("layer without a name".to_string()))?
            .to_string();
        let layer_type = msg.get_str("type").ok_or_else(|| {
            TransformError::MalformedGraph(format!("layer '{}' has no type", name))
        })?;

        let mut params = msg.clone();
        for field in ["name", "type", "bottom", "top"] {
            params.remove_all(field);
        }

        Ok(Self {
            kind: LayerKind::from_type(layer_type),
            inputs: msg.get_strs("bottom"),
            outputs: msg.get_strs("top"),
            name,
            params,
        })
    }

    /// Convert back to a `layer { ... }` message
    pub fn to_message(&self) -> TextMessage {
        let mut msg = TextMessage::new();
        msg.push("name", TextValue::Str(self.name.clone()));
        msg.push("type", TextValue::Str(self.kind.as_type().to_string()));
        for input in &self.inputs {
            msg.push("bottom", TextValue::Str(input.clone()));
        }
        for output in &self.outputs {
            msg.push("top", TextValue::Str(output.clone()));
        }
        for (name, value) in self.params.fields() {
            msg.push(name, value.clone());
        }
        msg
    }

    /// Whether the layer writes one of its own inputs
    pub fn is_in_place(&self) -> bool {
        self.outputs.iter().any(|o| self.inputs.contains(o))
    }

    /// Sub-message holding this kind's parameters
    pub fn kind_param(&self) -> Option<&TextMessage> {
        match self.kind {
            LayerKind::Convolution => self.params.get_message("convolution_param"),
            LayerKind::Normalization => self.params.get_message("batch_norm_param"),
            LayerKind::AffineScale => self.params.get_message("scale_param"),
            LayerKind::Other(_) => None,
        }
    }

    /// Whether the layer learns a bias blob
    ///
    /// Caffe defaults `bias_term` to true for convolutions and false for
    /// scale layers.
    pub fn bias_term(&self) -> bool {
        let default = matches!(self.kind, LayerKind::Convolution);
        self.kind_param()
            .and_then(|p| p.get_bool("bias_term"))
            .unwrap_or(default)
    }

    /// Enable or disable the convolution bias
    pub fn set_bias_term(&mut self, enabled: bool) {
        self.params.message_or_insert("convolution_param").set(
            "bias_term",
            TextValue::Raw(if enabled { "true" } else { "false" }.to_string()),
        );
    }
}
