//! Extension methods for Caffe protobuf types
//!
//! Provides convenient helper methods for working with the `.caffemodel` messages.

use super::caffe::*;

// ============================================================================
// NetParameter extensions
// ============================================================================

impl NetParameter {
    /// Get a layer by name
    pub fn find_layer(&self, name: &str) -> Option<&LayerParameter> {
        self.layer.iter().find(|l| l.name == name)
    }

    /// Number of layers carrying at least one blob
    pub fn parameterized_layer_count(&self) -> usize {
        self.layer.iter().filter(|l| !l.blobs.is_empty()).count()
    }
}

// ============================================================================
// LayerParameter extensions
// ============================================================================

impl LayerParameter {
    /// Check if this layer has a specific type
    pub fn is_type(&self, layer_type: &str) -> bool {
        self.r#type == layer_type
    }
}

// ============================================================================
// BlobProto extensions
// ============================================================================

impl BlobProto {
    /// Get the blob dimensions
    ///
    /// Uses `shape` when present, otherwise the legacy 4-d fields. A blob
    /// with neither is treated as 1-d over its data.
    pub fn dims(&self) -> Vec<i64> {
        if let Some(shape) = &self.shape {
            return shape.dim.clone();
        }

        if self.num != 0 || self.channels != 0 || self.height != 0 || self.width != 0 {
            return vec![
                self.num as i64,
                self.channels as i64,
                self.height as i64,
                self.width as i64,
            ];
        }

        vec![self.len() as i64]
    }

    /// Number of stored values (single or double precision)
    pub fn len(&self) -> usize {
        if self.data.is_empty() {
            self.double_data.len()
        } else {
            self.data.len()
        }
    }

    /// Check if the blob stores no values
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values as f32, narrowing `double_data` if that is what is stored
    pub fn values_f32(&self) -> Vec<f32> {
        if self.data.is_empty() {
            self.double_data.iter().map(|&v| v as f32).collect()
        } else {
            self.data.clone()
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Create a new LayerParameter without blobs
pub fn make_layer(layer_type: &str, bottoms: &[&str], tops: &[&str], name: &str) -> LayerParameter {
    LayerParameter {
        name: name.to_string(),
        r#type: layer_type.to_string(),
        bottom: bottoms.iter().map(|s| s.to_string()).collect(),
        top: tops.iter().map(|s| s.to_string()).collect(),
        blobs: Vec::new(),
    }
}
