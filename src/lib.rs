//! # Caffe Optimizer
//!
//! Folds BatchNorm and Scale layers into the preceding Convolution of a
//! trained Caffe network.
//!
//! At inference time `Convolution → BatchNorm → Scale` is one affine map per
//! output channel, so the chain can be replaced by a single convolution with
//! rescaled weights and a new bias. The result is a smaller network that
//! produces the same outputs up to floating-point rounding.
//!
//! ## Features
//!
//! - **Chain Detection**: Find fusable chains, including in-place ones
//! - **Topology Rewrite**: Drop folded layers and rename the convolution to `<conv>/mod`
//! - **Weight Fusion**: Compute the new convolution weights and bias
//! - **Equivalence Check**: Run both networks on the same random input
//!
//! ## Example
//!
//! ```ignore
//! use caffe_optimizer::prelude::*;
//!
//! let stats = fuse_files("deploy.prototxt", "weights.caffemodel", FuseOptions::default())?;
//! println!("{} -> {} layers", stats.original_layers, stats.fused_layers);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

// ============================================================================
// Module declarations
// ============================================================================

pub mod builder;
pub mod error;
pub mod graph;
pub mod infer;
pub mod io;
pub mod params;
pub mod pattern;
pub mod proto;
pub mod tensor;
pub mod traits;
pub mod transform;
pub mod transformers;

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Prelude module - import commonly used types with `use caffe_optimizer::prelude::*`
pub mod prelude {
    pub use crate::builder::ModelBuilder;
    pub use crate::error::{CaffeResult, TransformError};
    pub use crate::graph::{LayerGraph, LayerKind, LayerNode};
    pub use crate::infer::{EquivalenceChecker, EquivalenceConfig, EquivalenceReport, Network};
    pub use crate::io::{
        fuse_files, fuse_model, fused_output_path, load_net_definition, load_parameter_store,
        save_outputs, FuseOptions, FuseStats, FusedModel,
    };
    pub use crate::params::ParameterStore;
    pub use crate::pattern::{detect_chains, ChainDetector, FusionRecord};
    pub use crate::proto::{BlobProto, LayerParameter, NetParameter};
    pub use crate::traits::{GraphPass, PassChain};
    pub use crate::transform::{fused_name, TopologyRewriter};
    pub use crate::transformers::{FuseConvBN, TransformResult};
}

// ============================================================================
// Crate-level re-exports
// ============================================================================

pub use error::{CaffeResult, TransformError};
pub use traits::GraphPass;

// ============================================================================
// Version information
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_prelude_pipeline() {
        use crate::prelude::*;

        let graph = LayerGraph::from_prototxt(
            r#"
input: "data"
layer { name: "conv1" type: "Convolution" bottom: "data" top: "conv1" }
layer { name: "bn1" type: "BatchNorm" bottom: "conv1" top: "conv1" }
"#,
        )
        .unwrap();
        let record = detect_chains(&graph);
        assert_eq!(record.fused_convolutions().collect::<Vec<_>>(), vec!["conv1"]);
        assert_eq!(fused_name("conv1"), "conv1/mod");
    }
}
