//! Shape utilities for Caffe blobs
//!
//! Functions for working with tensor shapes and dimensions.

use crate::error::{CaffeResult, TransformError};

/// Calculate total number of elements from shape
pub fn numel(shape: &[i64]) -> usize {
    if shape.is_empty() {
        1 // scalar
    } else {
        shape.iter().map(|&d| d.max(0) as usize).product()
    }
}

/// Convert blob dimensions to ndarray dimensions
pub fn dims_to_usize(dims: &[i64]) -> CaffeResult<Vec<usize>> {
    dims.iter()
        .map(|&d| {
            usize::try_from(d).map_err(|_| {
                TransformError::ShapeMismatch(format!("negative dimension in {:?}", dims))
            })
        })
        .collect()
}

/// Format a shape the way Caffe logs it (`64 3 7 7 (9408)`)
pub fn shape_to_string(shape: &[usize]) -> String {
    let count: usize = shape.iter().product();
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("{} ({})", dims.join(" "), count)
}
