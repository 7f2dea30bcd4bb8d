//! Pattern matching module for Caffe layer chains
//!
//! This module identifies the layer sequences the optimizer folds together.
//!
//! # Overview
//!
//! The chain detector works by:
//! 1. Starting from a BatchNorm or Scale layer (the anchor)
//! 2. Walking producers in reverse order (output → input)
//! 3. Requiring each link to be the sole reader of its producer's value
//!
//! # Example
//!
//! ```ignore
//! use caffe_optimizer::pattern::{detect_chains, detect_fusable_conv};
//!
//! // Single lookup
//! if let Some(conv) = detect_fusable_conv(&graph, "scale1") {
//!     println!("scale1 folds into {}", conv);
//! }
//!
//! // Whole graph
//! let record = detect_chains(&graph);
//! for conv in record.fused_convolutions() {
//!     println!("{} <- {:?}", conv, record.normalization_for(conv));
//! }
//! ```

pub mod chain;

// Re-export main types
pub use chain::{detect_chains, detect_fusable_conv, ChainDetector, FusionRecord};
