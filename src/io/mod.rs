//! Caffe I/O module
//!
//! This module provides functions for loading and saving Caffe networks,
//! and the file-level fusion entry point.
//!
//! # Example
//!
//! ```ignore
//! use caffe_optimizer::io::{fuse_files, FuseOptions};
//!
//! // Writes deploy-m.prototxt and weights-m.caffemodel next to the inputs
//! let stats = fuse_files("deploy.prototxt", "weights.caffemodel", FuseOptions::default())?;
//! println!("Folded {} chains, removed {} layers", stats.chains_fused, stats.layers_removed());
//! ```

pub mod reader;
pub mod writer;

// Re-exports
pub use reader::{
    load_net_definition, load_net_parameter, load_net_parameter_from_bytes, load_parameter_store,
};
pub use writer::{
    net_parameter_to_bytes, save_net_parameter, save_outputs, SaveStats,
};

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::builder::ModelBuilder;
use crate::error::CaffeResult;
use crate::graph::LayerGraph;
use crate::infer::{EquivalenceChecker, EquivalenceConfig, EquivalenceReport};
use crate::params::ParameterStore;
use crate::proto::NetParameter;
use crate::transform::TopologyRewriter;
use crate::transformers::{FuseConvBN, TransformResult};

/// Suffix inserted into output file names
pub const OUTPUT_SUFFIX: &str = "-m";

/// Fusion statistics
#[derive(Debug, Clone, Default)]
pub struct FuseStats {
    /// Layer count before fusion
    pub original_layers: usize,
    /// Layer count after fusion
    pub fused_layers: usize,
    /// Convolutions that absorbed a chain
    pub chains_fused: usize,
    /// Written network definition
    pub deploy_output: PathBuf,
    /// Written parameter store
    pub model_output: PathBuf,
    /// Output sizes
    pub save: SaveStats,
    /// Rewrite statistics
    pub transform: TransformResult,
    /// Equivalence check outcome, if one ran
    pub equivalence: Option<EquivalenceReport>,
}

impl FuseStats {
    /// Layers removed by the fusion
    pub fn layers_removed(&self) -> usize {
        self.original_layers.saturating_sub(self.fused_layers)
    }
}

/// Fusion options
#[derive(Debug, Clone)]
pub struct FuseOptions {
    /// Epsilon added to the variance
    pub epsilon: f32,
    /// Run the equivalence check on the written outputs
    pub equivalence: Option<EquivalenceConfig>,
}

impl Default for FuseOptions {
    fn default() -> Self {
        Self {
            epsilon: FuseConvBN::default().epsilon,
            equivalence: None,
        }
    }
}

impl FuseOptions {
    /// Set the variance epsilon
    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Enable the equivalence check
    pub fn with_equivalence_check(mut self, config: EquivalenceConfig) -> Self {
        self.equivalence = Some(config);
        self
    }
}

/// A fused network held in memory
#[derive(Debug, Clone)]
pub struct FusedModel {
    /// Rewritten definition
    pub graph: LayerGraph,
    /// Parameters of the rewritten definition
    pub store: ParameterStore,
    /// Rewrite statistics
    pub result: TransformResult,
}

impl FusedModel {
    /// The `.caffemodel` message for this network
    pub fn to_net_parameter(&self) -> NetParameter {
        self.store.to_net_parameter(&self.graph)
    }
}

/// Fuse a network in memory
pub fn fuse_model(
    graph: &LayerGraph,
    store: &ParameterStore,
    options: &FuseOptions,
) -> CaffeResult<FusedModel> {
    let rewrite = TopologyRewriter::new().rewrite(graph)?;

    let fused = FuseConvBN::new()
        .with_epsilon(options.epsilon)
        .fuse(graph, store, &rewrite.record)?;

    let fused_store = ModelBuilder::new(&rewrite.graph)
        .with_source(store)
        .with_fused(fused)
        .build_store()?;

    Ok(FusedModel {
        graph: rewrite.graph,
        store: fused_store,
        result: rewrite.result,
    })
}

/// Output path for a fused file: `-m` before the extension, or appended
/// when there is none
///
/// `deploy.prototxt` becomes `deploy-m.prototxt`.
pub fn fused_output_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    let stem = path.file_stem().unwrap_or_default();

    let mut name = OsString::from(stem);
    name.push(OUTPUT_SUFFIX);
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    path.with_file_name(name)
}

/// Fuse a deploy definition and its weights, writing `-m` siblings
///
/// Nothing is written unless every step succeeds. With
/// [`FuseOptions::equivalence`] set, the encoded outputs are decoded again
/// and compared with the inputs before they are written.
pub fn fuse_files<P1: AsRef<Path>, P2: AsRef<Path>>(
    deploy: P1,
    model: P2,
    options: FuseOptions,
) -> CaffeResult<FuseStats> {
    let deploy = deploy.as_ref();
    let model = model.as_ref();

    let graph = load_net_definition(deploy)?;
    let store = load_parameter_store(model)?;
    let fused = fuse_model(&graph, &store, &options)?;

    let net = fused.to_net_parameter();

    // Compare against the encoded outputs before anything touches the disk
    let equivalence = match &options.equivalence {
        Some(config) => {
            let encoded_graph = LayerGraph::from_prototxt(&fused.graph.to_prototxt())?;
            let encoded_store = ParameterStore::from_net_parameter(
                &load_net_parameter_from_bytes(&net_parameter_to_bytes(&net))?,
            )?;
            Some(EquivalenceChecker::new(config.clone()).check(
                &graph,
                &store,
                &encoded_graph,
                &encoded_store,
            )?)
        }
        None => None,
    };

    let deploy_output = fused_output_path(deploy);
    let model_output = fused_output_path(model);
    let save = save_outputs(&fused.graph, &deploy_output, &net, &model_output)?;

    let stats = FuseStats {
        original_layers: graph.len(),
        fused_layers: fused.graph.len(),
        chains_fused: fused.result.patterns_matched,
        deploy_output,
        model_output,
        save,
        transform: fused.result,
        equivalence,
    };

    tracing::info!(
        chains = stats.chains_fused,
        before = stats.original_layers,
        after = stats.fused_layers,
        deploy = %stats.deploy_output.display(),
        model = %stats.model_output.display(),
        "fusion complete"
    );

    Ok(stats)
}
