//! Convolution + BatchNorm + Scale weight fusion
//!
//! Computes the weight and bias of a fused convolution from the blobs of the
//! original convolution, BatchNorm and Scale layers.

use indexmap::IndexMap;
use ndarray::{Array1, ArrayD, Axis};

use crate::error::{CaffeResult, TransformError};
use crate::graph::LayerGraph;
use crate::params::ParameterStore;
use crate::pattern::FusionRecord;
use crate::tensor::shape_to_string;
use crate::transform::fused_name;

/// Fused convolution blobs
#[derive(Debug, Clone, PartialEq)]
pub struct FusedWeights {
    /// `[K, C, kh, kw]`
    pub weight: ArrayD<f32>,
    /// `[K]`
    pub bias: ArrayD<f32>,
}

impl FusedWeights {
    /// Blob list in Caffe order
    pub fn into_blobs(self) -> Vec<ArrayD<f32>> {
        vec![self.weight, self.bias]
    }
}

/// Fuse Convolution + BatchNorm (+ Scale)
///
/// Caffe's BatchNorm stores running sums and a moving-average factor rather
/// than the statistics themselves:
///
/// ```text
/// s     = 1 / count          (0 if count is 0)
/// mean  = mean_sum * s
/// var   = var_sum * s
/// ```
///
/// Conv:  y = W * x + b
/// BN:    z = (y - mean) / sqrt(var + eps)
/// Scale: o = alpha * z + beta
///
/// Fused: o = W' * x + b'
/// where:
///   W' = W * alpha / sqrt(var + eps)
///   b' = (b - mean) * alpha / sqrt(var + eps) + beta
#[derive(Debug, Clone)]
pub struct FuseConvBN {
    /// Epsilon for numerical stability (default 1e-5)
    pub epsilon: f32,
}

impl Default for FuseConvBN {
    fn default() -> Self {
        Self { epsilon: 1e-5 }
    }
}

impl FuseConvBN {
    /// Create with the default epsilon
    pub fn new() -> Self {
        Self::default()
    }

    /// Set epsilon
    pub fn with_epsilon(mut self, eps: f32) -> Self {
        self.epsilon = eps;
        self
    }

    /// Fuse the blobs of one chain
    ///
    /// `conv` holds the weight and, if the convolution had one, the bias.
    /// `norm` holds the mean sum, variance sum and count. `scale` holds alpha
    /// and optionally beta; without a Scale layer alpha is 1 and beta 0.
    pub fn fuse_chain(
        &self,
        conv_name: &str,
        conv: &[ArrayD<f32>],
        norm: &[ArrayD<f32>],
        scale: Option<&[ArrayD<f32>]>,
    ) -> CaffeResult<FusedWeights> {
        let weight = conv
            .first()
            .ok_or_else(|| TransformError::MissingParameter(format!("{}: weight blob", conv_name)))?;
        if weight.ndim() < 1 {
            return Err(TransformError::ShapeMismatch(format!(
                "{}: weight blob has no output channel axis",
                conv_name
            )));
        }
        let out_channels = weight.len_of(Axis(0));

        let bias = match conv.get(1) {
            Some(b) => channel_vector(conv_name, "bias", b, out_channels)?,
            None => Array1::zeros(out_channels),
        };

        if norm.len() < 3 {
            return Err(TransformError::MissingParameter(format!(
                "{}: BatchNorm needs mean, variance and count blobs, found {}",
                conv_name,
                norm.len()
            )));
        }
        let mean_sum = channel_vector(conv_name, "mean", &norm[0], out_channels)?;
        let var_sum = channel_vector(conv_name, "variance", &norm[1], out_channels)?;
        let count = norm[2].iter().next().copied().ok_or_else(|| {
            TransformError::MissingParameter(format!("{}: empty BatchNorm count blob", conv_name))
        })?;

        let s = if count != 0.0 {
            1.0 / f64::from(count)
        } else {
            tracing::warn!(
                conv = conv_name,
                "BatchNorm count is zero, folding with zeroed statistics"
            );
            0.0
        };

        let (alpha, beta) = match scale {
            Some(blobs) => {
                let alpha = blobs.first().ok_or_else(|| {
                    TransformError::MissingParameter(format!("{}: Scale factor blob", conv_name))
                })?;
                let alpha = channel_vector(conv_name, "scale", alpha, out_channels)?;
                let beta = match blobs.get(1) {
                    Some(b) => channel_vector(conv_name, "scale bias", b, out_channels)?,
                    None => Array1::zeros(out_channels),
                };
                (alpha, beta)
            }
            None => (Array1::ones(out_channels), Array1::zeros(out_channels)),
        };

        let eps = f64::from(self.epsilon);
        let mut factor = Array1::<f64>::zeros(out_channels);
        let mut fused_bias = Array1::<f32>::zeros(out_channels);
        for k in 0..out_channels {
            let u = mean_sum[k] * s;
            let v = var_sum[k] * s;
            factor[k] = alpha[k] / (v + eps).sqrt();
            fused_bias[k] = (factor[k] * (bias[k] - u) + beta[k]) as f32;
        }

        // W'[k, ...] = factor[k] * W[k, ...]
        let mut fused_weight = weight.clone();
        for (mut channel, &f) in fused_weight.axis_iter_mut(Axis(0)).zip(factor.iter()) {
            channel.mapv_inplace(|w| (f64::from(w) * f) as f32);
        }

        Ok(FusedWeights {
            weight: fused_weight,
            bias: fused_bias.into_dyn(),
        })
    }

    /// Fuse every recorded chain
    ///
    /// `graph` is the network before rewriting and `store` its parameters.
    /// Returns the new blobs keyed by fused convolution name.
    pub fn fuse(
        &self,
        graph: &LayerGraph,
        store: &ParameterStore,
        record: &FusionRecord,
    ) -> CaffeResult<IndexMap<String, Vec<ArrayD<f32>>>> {
        let mut fused = IndexMap::with_capacity(record.len());

        for conv in record.fused_convolutions() {
            let norm_name = record.normalization_for(conv).ok_or_else(|| {
                TransformError::Internal(format!("{} recorded without a BatchNorm", conv))
            })?;
            let scale_name = record.affine_scale_for(conv);

            if let Some(declared) = self.mismatched_epsilon(graph, norm_name) {
                tracing::warn!(
                    layer = norm_name,
                    declared,
                    used = self.epsilon,
                    "BatchNorm declares a different eps"
                );
            }

            let conv_blobs = layer_blobs(store, conv)?;
            let norm_blobs = layer_blobs(store, norm_name)?;
            let scale_blobs = scale_name.map(|s| layer_blobs(store, s)).transpose()?;

            let weights = self.fuse_chain(conv, conv_blobs, norm_blobs, scale_blobs)?;
            tracing::debug!(
                conv,
                norm = norm_name,
                scale = scale_name.unwrap_or("-"),
                shape = %shape_to_string(weights.weight.shape()),
                "fused convolution weights"
            );

            fused.insert(fused_name(conv), weights.into_blobs());
        }

        Ok(fused)
    }

    /// The `eps` a BatchNorm layer declares, if it differs from ours
    fn mismatched_epsilon(&self, graph: &LayerGraph, norm_name: &str) -> Option<f32> {
        graph
            .find_by_name(norm_name)
            .and_then(|n| n.kind_param())
            .and_then(|p| p.get_parsed::<f32>("eps"))
            .filter(|eps| (eps - self.epsilon).abs() > f32::EPSILON * self.epsilon.abs().max(1.0))
    }
}

fn layer_blobs<'a>(store: &'a ParameterStore, layer: &str) -> CaffeResult<&'a [ArrayD<f32>]> {
    store.get(layer).ok_or_else(|| {
        TransformError::MissingParameter(format!("no blobs for layer '{}' in the model", layer))
    })
}

/// Flatten a per-channel blob, checking its length
fn channel_vector(
    conv_name: &str,
    what: &str,
    blob: &ArrayD<f32>,
    channels: usize,
) -> CaffeResult<Array1<f64>> {
    if blob.len() != channels {
        return Err(TransformError::ShapeMismatch(format!(
            "{}: {} has {} values, expected {}",
            conv_name,
            what,
            blob.len(),
            channels
        )));
    }
    Ok(blob.iter().map(|&v| f64::from(v)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::vec_to_array;
    use ndarray::IxDyn;

    fn weight(shape: &[usize], data: Vec<f32>) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
    }

    fn assert_close(a: f32, b: f32) {
        assert!(
            (a - b).abs() <= 1e-4 * b.abs().max(1.0),
            "{} vs {}",
            a,
            b
        );
    }

    #[test]
    fn test_scenario() {
        // K=2, no conv bias; mean=[1,2], var=[3,4], count=2 (s=0.5)
        let w = weight(&[2, 1, 1, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let norm = vec![
            vec_to_array(&[1.0, 2.0]),
            vec_to_array(&[3.0, 4.0]),
            vec_to_array(&[2.0]),
        ];
        let scale = vec![vec_to_array(&[1.0, 1.0]), vec_to_array(&[0.0, 0.0])];

        let fused = FuseConvBN::new()
            .fuse_chain("conv1", &[w], &norm, Some(&scale))
            .unwrap();

        let f0 = 1.0 / (3.0f32 * 0.5 + 1e-5).sqrt();
        let f1 = 1.0 / (4.0f32 * 0.5 + 1e-5).sqrt();

        assert_eq!(fused.weight.shape(), &[2, 1, 1, 2]);
        assert_close(fused.weight[[0, 0, 0, 0]], 1.0 * f0);
        assert_close(fused.weight[[0, 0, 0, 1]], 2.0 * f0);
        assert_close(fused.weight[[1, 0, 0, 0]], 3.0 * f1);
        assert_close(fused.weight[[1, 0, 0, 1]], 4.0 * f1);

        assert_eq!(fused.bias.shape(), &[2]);
        assert_close(fused.bias[0], (0.0 - 1.0 * 0.5) * f0);
        assert_close(fused.bias[1], (0.0 - 2.0 * 0.5) * f1);
    }

    #[test]
    fn test_numeric_equivalence_1x1() {
        // 1x1 convolution over 3 input channels, 2 output channels
        let w_data = vec![0.2, -0.4, 0.9, 1.5, 0.3, -0.7];
        let w = weight(&[2, 3, 1, 1], w_data.clone());
        let b = vec_to_array(&[0.1, -0.3]);
        let norm = vec![
            vec_to_array(&[4.0, -2.0]),
            vec_to_array(&[10.0, 6.0]),
            vec_to_array(&[4.0]),
        ];
        let scale = vec![vec_to_array(&[0.5, 2.0]), vec_to_array(&[1.0, -1.0])];

        let fused = FuseConvBN::new()
            .fuse_chain("conv1", &[w, b], &norm, Some(&scale))
            .unwrap();

        let x = [0.7f32, -1.2, 3.4];
        for k in 0..2 {
            let y: f32 = (0..3).map(|c| w_data[k * 3 + c] * x[c]).sum::<f32>() + [0.1, -0.3][k];
            let mean = [4.0f32, -2.0][k] / 4.0;
            let var = [10.0f32, 6.0][k] / 4.0;
            let z = (y - mean) / (var + 1e-5).sqrt();
            let expected = [0.5f32, 2.0][k] * z + [1.0f32, -1.0][k];

            let got: f32 = (0..3)
                .map(|c| fused.weight[[k, c, 0, 0]] * x[c])
                .sum::<f32>()
                + fused.bias[k];
            assert_close(got, expected);
        }
    }

    #[test]
    fn test_without_scale_layer() {
        let w = weight(&[1, 1, 1, 1], vec![2.0]);
        let norm = vec![vec_to_array(&[1.0]), vec_to_array(&[1.0]), vec_to_array(&[1.0])];

        let fused = FuseConvBN::new()
            .with_epsilon(0.0)
            .fuse_chain("conv1", &[w], &norm, None)
            .unwrap();

        assert_close(fused.weight[[0, 0, 0, 0]], 2.0);
        assert_close(fused.bias[0], -1.0);
    }

    #[test]
    fn test_scale_without_bias_blob() {
        let w = weight(&[1, 1, 1, 1], vec![1.0]);
        let norm = vec![vec_to_array(&[0.0]), vec_to_array(&[1.0]), vec_to_array(&[1.0])];
        let scale = vec![vec_to_array(&[3.0])];

        let fused = FuseConvBN::new()
            .with_epsilon(0.0)
            .fuse_chain("conv1", &[w], &norm, Some(&scale))
            .unwrap();

        assert_close(fused.weight[[0, 0, 0, 0]], 3.0);
        assert_close(fused.bias[0], 0.0);
    }

    #[test]
    fn test_zero_count_zeroes_statistics() {
        let w = weight(&[1, 1, 1, 1], vec![1.0]);
        let norm = vec![vec_to_array(&[5.0]), vec_to_array(&[7.0]), vec_to_array(&[0.0])];

        let fused = FuseConvBN::new()
            .fuse_chain("conv1", &[w], &norm, None)
            .unwrap();

        let f = 1.0 / 1e-5f32.sqrt();
        assert_close(fused.weight[[0, 0, 0, 0]], f);
        assert_close(fused.bias[0], 0.0);
    }

    #[test]
    fn test_channel_mismatch() {
        let w = weight(&[2, 1, 1, 1], vec![1.0, 1.0]);
        let norm = vec![vec_to_array(&[0.0]), vec_to_array(&[1.0, 1.0]), vec_to_array(&[1.0])];

        let err = FuseConvBN::new()
            .fuse_chain("conv1", &[w], &norm, None)
            .unwrap_err();
        assert!(matches!(err, TransformError::ShapeMismatch(_)));
    }

    #[test]
    fn test_missing_blobs() {
        let norm = vec![vec_to_array(&[0.0])];
        let err = FuseConvBN::new()
            .fuse_chain("conv1", &[], &norm, None)
            .unwrap_err();
        assert!(matches!(err, TransformError::MissingParameter(_)));

        let w = weight(&[1, 1, 1, 1], vec![1.0]);
        let err = FuseConvBN::new()
            .fuse_chain("conv1", &[w], &norm, None)
            .unwrap_err();
        assert!(matches!(err, TransformError::MissingParameter(_)));
    }

    #[test]
    fn test_fuse_from_store() {
        let graph = LayerGraph::from_prototxt(
            r#"
input: "data"
layer { name: "conv1" type: "Convolution" bottom: "data" top: "conv1" }
layer { name: "bn1" type: "BatchNorm" bottom: "conv1" top: "conv1"
        batch_norm_param { eps: 0.001 } }
layer { name: "relu1" type: "ReLU" bottom: "conv1" top: "conv1" }
"#,
        )
        .unwrap();
        let record = crate::pattern::detect_chains(&graph);

        let mut store = ParameterStore::new();
        store.insert("conv1", vec![weight(&[1, 1, 1, 1], vec![1.0])]);
        store.insert(
            "bn1",
            vec![vec_to_array(&[0.0]), vec_to_array(&[1.0]), vec_to_array(&[1.0])],
        );

        let fused = FuseConvBN::new().fuse(&graph, &store, &record).unwrap();
        assert_eq!(fused.len(), 1);
        let blobs = &fused["conv1/mod"];
        assert_eq!(blobs.len(), 2);
        assert_eq!(blobs[1].shape(), &[1]);

        store.insert("bn1", vec![]);
        assert!(FuseConvBN::new().fuse(&graph, &store, &record).is_err());
    }

    #[test]
    fn test_declared_epsilon_mismatch() {
        let graph = LayerGraph::from_prototxt(
            r#"
input: "data"
layer { name: "conv1" type: "Convolution" bottom: "data" top: "conv1" }
layer { name: "bn1" type: "BatchNorm" bottom: "conv1" top: "conv1"
        batch_norm_param { eps: 0.001 } }
layer { name: "conv2" type: "Convolution" bottom: "conv1" top: "conv2" }
layer { name: "bn2" type: "BatchNorm" bottom: "conv2" top: "conv2" }
"#,
        )
        .unwrap();

        let fuser = FuseConvBN::new();
        assert_eq!(fuser.mismatched_epsilon(&graph, "bn1"), Some(0.001));
        assert_eq!(fuser.mismatched_epsilon(&graph, "bn2"), None);
        assert_eq!(
            FuseConvBN::new()
                .with_epsilon(0.001)
                .mismatched_epsilon(&graph, "bn1"),
            None
        );
    }
}
