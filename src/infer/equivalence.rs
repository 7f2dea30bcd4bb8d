//! Behavioral comparison of an original and a fused network

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;

use crate::error::{CaffeResult, TransformError};
use crate::graph::LayerGraph;
use crate::params::ParameterStore;

use super::{input_shapes, net_outputs, Network};

/// Settings for the equivalence check
#[derive(Debug, Clone, PartialEq)]
pub struct EquivalenceConfig {
    /// RNG seed; a fresh one is drawn when `None`
    pub seed: Option<u64>,
    /// Inputs are uniform in `[0, 1) * input_scale`
    pub input_scale: f32,
    /// Output blob to compare; the last network output when `None`
    pub output_blob: Option<String>,
    /// Shape used for every input instead of the declared one
    pub input_shape: Option<Vec<usize>>,
}

impl Default for EquivalenceConfig {
    fn default() -> Self {
        Self {
            seed: None,
            input_scale: 255.0,
            output_blob: None,
            input_shape: None,
        }
    }
}

impl EquivalenceConfig {
    /// Fix the RNG seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the input value range
    pub fn with_input_scale(mut self, scale: f32) -> Self {
        self.input_scale = scale;
        self
    }

    /// Compare a named blob instead of the last output
    pub fn with_output_blob(mut self, blob: impl Into<String>) -> Self {
        self.output_blob = Some(blob.into());
        self
    }

    /// Override the declared input shape
    pub fn with_input_shape(mut self, shape: Vec<usize>) -> Self {
        self.input_shape = Some(shape);
        self
    }
}

/// Outcome of one equivalence run
#[derive(Debug, Clone, PartialEq)]
pub struct EquivalenceReport {
    /// Seed the input was drawn with
    pub seed: u64,
    /// Compared blob of the original network
    pub original_output: String,
    /// Compared blob of the fused network
    pub fused_output: String,
    /// Argmax of the original output
    pub original_class: usize,
    /// Argmax of the fused output
    pub fused_class: usize,
    /// Largest element-wise difference between the two outputs
    pub max_abs_diff: f32,
}

impl EquivalenceReport {
    /// Whether both networks predict the same class
    pub fn matches(&self) -> bool {
        self.original_class == self.fused_class
    }
}

/// Runs two networks on the same random input
#[derive(Debug, Clone, Default)]
pub struct EquivalenceChecker {
    config: EquivalenceConfig,
}

impl EquivalenceChecker {
    /// Create a checker
    pub fn new(config: EquivalenceConfig) -> Self {
        Self { config }
    }

    /// Current settings
    pub fn config(&self) -> &EquivalenceConfig {
        &self.config
    }

    /// Compare `original` with `fused`
    ///
    /// Input shapes are read from the original definition. The compared
    /// outputs are the configured blob, or the last output of each network.
    pub fn check(
        &self,
        original: &LayerGraph,
        original_params: &ParameterStore,
        fused: &LayerGraph,
        fused_params: &ParameterStore,
    ) -> CaffeResult<EquivalenceReport> {
        let seed = self
            .config
            .seed
            .unwrap_or_else(|| rand::thread_rng().gen());
        let inputs = self.random_inputs(original, seed)?;

        let original_output = self.output_blob(original)?;
        let fused_output = self.output_blob(fused)?;

        let mut original_values = Network::new(original, original_params).forward(inputs.clone())?;
        let mut fused_values = Network::new(fused, fused_params).forward(inputs)?;

        let a = take_output(&mut original_values, &original_output)?;
        let b = take_output(&mut fused_values, &fused_output)?;
        if a.shape() != b.shape() {
            return Err(TransformError::ShapeMismatch(format!(
                "original output {:?} vs fused output {:?}",
                a.shape(),
                b.shape()
            )));
        }

        let max_abs_diff = a
            .iter()
            .zip(b.iter())
            .fold(0.0f32, |m, (x, y)| m.max((x - y).abs()));

        let report = EquivalenceReport {
            seed,
            original_class: argmax(&a),
            fused_class: argmax(&b),
            original_output,
            fused_output,
            max_abs_diff,
        };

        tracing::info!(
            seed,
            original = report.original_class,
            fused = report.fused_class,
            max_abs_diff,
            "equivalence check"
        );
        if !report.matches() {
            tracing::warn!(
                "predicted class differs: {} vs {}",
                report.original_class,
                report.fused_class
            );
        }

        Ok(report)
    }

    fn random_inputs(
        &self,
        graph: &LayerGraph,
        seed: u64,
    ) -> CaffeResult<FxHashMap<String, ArrayD<f32>>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = self.config.input_scale;

        let mut inputs = FxHashMap::default();
        for (name, declared) in input_shapes(graph)? {
            let shape = self.config.input_shape.clone().unwrap_or(declared);
            let value = ArrayD::from_shape_simple_fn(IxDyn(&shape), || rng.gen::<f32>() * scale);
            inputs.insert(name, value);
        }

        if inputs.is_empty() {
            return Err(TransformError::MissingParameter(
                "network declares no inputs".to_string(),
            ));
        }
        Ok(inputs)
    }

    fn output_blob(&self, graph: &LayerGraph) -> CaffeResult<String> {
        if let Some(blob) = &self.config.output_blob {
            return Ok(blob.clone());
        }
        net_outputs(graph).pop().ok_or_else(|| {
            TransformError::MalformedGraph("network has no output blob".to_string())
        })
    }
}

fn take_output(
    values: &mut FxHashMap<String, ArrayD<f32>>,
    blob: &str,
) -> CaffeResult<ArrayD<f32>> {
    values
        .remove(blob)
        .ok_or_else(|| TransformError::MissingParameter(format!("output blob '{}'", blob)))
}

/// Index of the largest value of the flattened array
fn argmax(values: &ArrayD<f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
            if v > max {
                (i, v)
            } else {
                (best, max)
            }
        })
        .0
}
