//! Tensor utilities for Caffe blobs
//!
//! This module provides utilities for working with parameter tensors:
//! - Shape utilities (`shape`)
//! - Conversion between BlobProto and ndarray (`convert`)
//!
//! # Example
//!
//! ```ignore
//! use caffe_optimizer::tensor::{blob_to_array, array_to_blob};
//!
//! // Convert BlobProto to ndarray
//! let array = blob_to_array(&blob)?;
//!
//! // Perform operations...
//! let result = &array * 2.0;
//!
//! // Convert back to BlobProto
//! let output = array_to_blob(&result);
//! ```

pub mod convert;
pub mod shape;

// Re-export commonly used items
pub use convert::{array_to_blob, blob_to_array, vec_to_array};
pub use shape::{dims_to_usize, numel, shape_to_string};
