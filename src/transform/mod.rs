//! Graph transformation module
//!
//! This module rewrites the topology of a network so that every fusable
//! `Convolution → BatchNorm → Scale` chain becomes a single convolution:
//!
//! - [`TopologyRewriter`]: Detection plus both rewrite passes
//! - [`retarget`]: Points surviving references at the fused names
//! - [`remove`]: Drops folded layers and renames fused convolutions
//!
//! # Overview
//!
//! Both passes are pure: each reads a graph and builds a new one. The
//! typical workflow is:
//!
//! 1. Detect chains on the unmodified graph
//! 2. Retarget references (forward)
//! 3. Remove folded layers (reverse)
//!
//! # Example
//!
//! ```ignore
//! use caffe_optimizer::transform::TopologyRewriter;
//!
//! let out = TopologyRewriter::new().rewrite(&graph)?;
//! println!("{} chains, {} layers left", out.record.len(), out.graph.len());
//! ```
//!
//! # Naming
//!
//! | Before | After |
//! |--------|-------|
//! | convolution layer `conv1` | `conv1/mod` |
//! | its output blob | `conv1/mod` |
//! | outputs of folded BatchNorm/Scale | `conv1/mod` |

pub mod remove;
pub mod retarget;
pub mod rewriter;

// Re-export main types
pub use remove::RemoveFusedLayers;
pub use retarget::RetargetReferences;
pub use rewriter::{RewriteOutput, TopologyRewriter};

/// Suffix marking a fused convolution
pub const FUSED_SUFFIX: &str = "/mod";

/// Name a convolution takes after fusion
pub fn fused_name(conv: &str) -> String {
    format!("{}{}", conv, FUSED_SUFFIX)
}
