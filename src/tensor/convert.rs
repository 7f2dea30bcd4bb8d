//! Tensor conversion utilities
//!
//! Convert between Caffe BlobProto and ndarray types.

use ndarray::{Array, Array1, ArrayD, IxDyn};

use crate::error::{CaffeResult, TransformError};
use crate::proto::{BlobProto, BlobShape};

use super::shape::{dims_to_usize, numel};

/// Convert BlobProto to f32 ndarray
///
/// This handles both single (`data`) and double (`double_data`) storage.
pub fn blob_to_array(blob: &BlobProto) -> CaffeResult<ArrayD<f32>> {
    let dims = blob.dims();
    let shape = dims_to_usize(&dims)?;
    let expected_len = numel(&dims);
    let data = blob.values_f32();

    if data.len() != expected_len {
        return Err(TransformError::ShapeMismatch(format!(
            "Blob data length {} does not match shape {:?} (expected {})",
            data.len(),
            dims,
            expected_len
        )));
    }

    Array::from_shape_vec(IxDyn(&shape), data).map_err(|e| TransformError::Internal(e.to_string()))
}

/// Create BlobProto from f32 array
pub fn array_to_blob(array: &ArrayD<f32>) -> BlobProto {
    BlobProto {
        shape: Some(BlobShape {
            dim: array.shape().iter().map(|&d| d as i64).collect(),
        }),
        data: array.iter().copied().collect(),
        ..Default::default()
    }
}

/// Create 1D array from f32 slice
pub fn vec_to_array(data: &[f32]) -> ArrayD<f32> {
    Array1::from(data.to_vec()).into_dyn()
}
