//! Caffe transformers module
//!
//! This module provides the weight-level half of the fusion:
//!
//! - **Fusion**: Fold BatchNorm and Scale blobs into the convolution
//! - **Statistics**: Counters shared with the topology rewrite
//!
//! # Example
//!
//! ```ignore
//! use caffe_optimizer::transformers::FuseConvBN;
//!
//! let fused = FuseConvBN::new()
//!     .with_epsilon(1e-5)
//!     .fuse(&original_graph, &store, &record)?;
//!
//! for (name, blobs) in &fused {
//!     println!("{}: weight {:?}", name, blobs[0].shape());
//! }
//! ```

/// Common utilities and types
pub mod common;
/// Fuse Conv + BN (+ Scale)
pub mod fuse_conv_bn;

pub use common::TransformResult;
pub use fuse_conv_bn::{FuseConvBN, FusedWeights};
