//! Layer kernels for the reference interpreter
//!
//! NCHW, f32, inference-phase semantics matching Caffe's CPU layers.

use ndarray::{concatenate, s, Array, Array2, Array4, ArrayD, ArrayView4, Axis, Ix4, IxDyn};

use crate::error::{CaffeResult, TransformError};
use crate::graph::{LayerKind, LayerNode};
use crate::proto::TextMessage;

/// Run one layer
///
/// `inputs` follow the layer's `bottom` order and `blobs` are its learned
/// parameters. Returns one array per `top`.
pub fn forward_layer(
    node: &LayerNode,
    inputs: &[&ArrayD<f32>],
    blobs: &[ArrayD<f32>],
) -> CaffeResult<Vec<ArrayD<f32>>> {
    let single = |out: ArrayD<f32>| Ok(vec![out]);

    match &node.kind {
        LayerKind::Convolution => single(convolution(node, first(node, inputs)?, blobs)?),
        LayerKind::Normalization => single(batch_norm(node, first(node, inputs)?, blobs)?),
        LayerKind::AffineScale => single(scale(node, inputs, blobs)?),
        LayerKind::Other(layer_type) => match layer_type.as_str() {
            "ReLU" => single(relu(node, first(node, inputs)?)),
            "Pooling" => single(pooling(node, first(node, inputs)?)?),
            "InnerProduct" => single(inner_product(node, first(node, inputs)?, blobs)?),
            "Softmax" => single(softmax(node, first(node, inputs)?)?),
            "Eltwise" => single(eltwise(node, inputs)?),
            "Concat" => single(concat(node, inputs)?),
            "Flatten" => single(flatten(node, first(node, inputs)?)?),
            "Split" => {
                let x = first(node, inputs)?;
                Ok(node.outputs.iter().map(|_| x.clone()).collect())
            }
            "Dropout" => single(first(node, inputs)?.clone()),
            _ => Err(TransformError::UnsupportedLayer {
                name: node.name.clone(),
                layer_type: layer_type.clone(),
            }),
        },
    }
}

// ============================================================================
// Parameter helpers
// ============================================================================

fn first<'a>(node: &LayerNode, inputs: &[&'a ArrayD<f32>]) -> CaffeResult<&'a ArrayD<f32>> {
    inputs
        .first()
        .copied()
        .ok_or_else(|| TransformError::InvalidLayer(format!("{}: no input", node.name)))
}

fn layer_param<'a>(node: &'a LayerNode, name: &str) -> Option<&'a TextMessage> {
    node.params.get_message(name)
}

fn as_4d<'a>(node: &LayerNode, x: &'a ArrayD<f32>) -> CaffeResult<ArrayView4<'a, f32>> {
    x.view().into_dimensionality::<Ix4>().map_err(|_| {
        TransformError::ShapeMismatch(format!(
            "{}: expected a 4-d input, got {:?}",
            node.name,
            x.shape()
        ))
    })
}

fn canonical_axis(node: &LayerNode, axis: i64, ndim: usize) -> CaffeResult<usize> {
    let resolved = if axis < 0 { axis + ndim as i64 } else { axis };
    if resolved < 0 || resolved >= ndim as i64 {
        return Err(TransformError::InvalidLayer(format!(
            "{}: axis {} out of range for {} dims",
            node.name, axis, ndim
        )));
    }
    Ok(resolved as usize)
}

/// `(h, w)` from either `name_h`/`name_w` or a repeated `name` field
fn spatial_pair(
    node: &LayerNode,
    param: Option<&TextMessage>,
    name: &str,
    default: Option<usize>,
) -> CaffeResult<(usize, usize)> {
    if let Some(p) = param {
        let h = p.get_parsed::<usize>(&format!("{}_h", name));
        let w = p.get_parsed::<usize>(&format!("{}_w", name));
        if let (Some(h), Some(w)) = (h, w) {
            return Ok((h, w));
        }

        // kernel_size, pad and stride carry the singular name in Caffe
        let values: Vec<usize> = p.get_parsed_all(&singular_field(name));
        match values.as_slice() {
            [] => {}
            [v] => return Ok((*v, *v)),
            [h, w] => return Ok((*h, *w)),
            _ => {
                return Err(TransformError::InvalidLayer(format!(
                    "{}: {} values for {}, expected 1 or 2",
                    node.name,
                    values.len(),
                    name
                )))
            }
        }
    }

    default
        .map(|d| (d, d))
        .ok_or_else(|| TransformError::MissingParameter(format!("{}: {}", node.name, name)))
}

fn singular_field(name: &str) -> String {
    match name {
        "kernel" => "kernel_size".to_string(),
        other => other.to_string(),
    }
}

// ============================================================================
// Convolution
// ============================================================================

fn convolution(
    node: &LayerNode,
    x: &ArrayD<f32>,
    blobs: &[ArrayD<f32>],
) -> CaffeResult<ArrayD<f32>> {
    let param = node.kind_param();
    let x = as_4d(node, x)?;
    let (batch, channels, height, width) = x.dim();

    let weight = blobs
        .first()
        .ok_or_else(|| TransformError::MissingParameter(format!("{}: weight", node.name)))?;
    let weight = as_4d(node, weight)?;
    let (out_channels, group_channels, kh, kw) = weight.dim();

    let group = param.and_then(|p| p.get_parsed::<usize>("group")).unwrap_or(1);
    let (ph, pw) = spatial_pair(node, param, "pad", Some(0))?;
    let (sh, sw) = spatial_pair(node, param, "stride", Some(1))?;
    let (dh, dw) = spatial_pair(node, param, "dilation", Some(1))?;

    if group == 0 || channels != group_channels * group || out_channels % group != 0 {
        return Err(TransformError::ShapeMismatch(format!(
            "{}: {} input channels, weight {:?}, group {}",
            node.name,
            channels,
            weight.shape(),
            group
        )));
    }

    if kh == 0 || kw == 0 {
        return Err(TransformError::ShapeMismatch(format!(
            "{}: empty kernel {}x{}",
            node.name, kh, kw
        )));
    }

    let extent_h = dh * (kh - 1) + 1;
    let extent_w = dw * (kw - 1) + 1;
    if height + 2 * ph < extent_h || width + 2 * pw < extent_w || sh == 0 || sw == 0 {
        return Err(TransformError::ShapeMismatch(format!(
            "{}: kernel {}x{} does not fit input {}x{}",
            node.name, kh, kw, height, width
        )));
    }
    let oh = (height + 2 * ph - extent_h) / sh + 1;
    let ow = (width + 2 * pw - extent_w) / sw + 1;

    let patch = group_channels * kh * kw;
    let kernels = weight
        .as_standard_layout()
        .into_owned()
        .into_shape((out_channels, patch))
        .map_err(|e| TransformError::Internal(e.to_string()))?;
    let group_out = out_channels / group;

    let mut output = Array4::<f32>::zeros((batch, out_channels, oh, ow));
    let mut cols = Array2::<f32>::zeros((patch, oh * ow));

    for b in 0..batch {
        for g in 0..group {
            // im2col: one row per (channel, ky, kx), one column per output pixel
            cols.fill(0.0);
            for c in 0..group_channels {
                let plane = x.slice(s![b, g * group_channels + c, .., ..]);
                for ky in 0..kh {
                    for kx in 0..kw {
                        let row = (c * kh + ky) * kw + kx;
                        for oy in 0..oh {
                            let iy = (oy * sh + ky * dh) as isize - ph as isize;
                            if iy < 0 || iy >= height as isize {
                                continue;
                            }
                            for ox in 0..ow {
                                let ix = (ox * sw + kx * dw) as isize - pw as isize;
                                if ix >= 0 && ix < width as isize {
                                    cols[[row, oy * ow + ox]] = plane[[iy as usize, ix as usize]];
                                }
                            }
                        }
                    }
                }
            }

            let range = g * group_out..(g + 1) * group_out;
            let result = kernels.slice(s![range.clone(), ..]).dot(&cols);
            let result = result
                .into_shape((group_out, oh, ow))
                .map_err(|e| TransformError::Internal(e.to_string()))?;
            output.slice_mut(s![b, range, .., ..]).assign(&result);
        }
    }

    if node.bias_term() {
        if let Some(bias) = blobs.get(1) {
            if bias.len() != out_channels {
                return Err(TransformError::ShapeMismatch(format!(
                    "{}: bias has {} values for {} channels",
                    node.name,
                    bias.len(),
                    out_channels
                )));
            }
            for (mut channel, &b) in output.axis_iter_mut(Axis(1)).zip(bias.iter()) {
                channel.mapv_inplace(|v| v + b);
            }
        }
    }

    Ok(output.into_dyn())
}

// ============================================================================
// Normalization and scaling
// ============================================================================

fn batch_norm(node: &LayerNode, x: &ArrayD<f32>, blobs: &[ArrayD<f32>]) -> CaffeResult<ArrayD<f32>> {
    if blobs.len() < 3 || x.ndim() < 2 {
        return Err(TransformError::MissingParameter(format!(
            "{}: mean, variance and count blobs over a channel axis",
            node.name
        )));
    }
    let eps = node
        .kind_param()
        .and_then(|p| p.get_parsed::<f32>("eps"))
        .unwrap_or(1e-5);

    let count = blobs[2].iter().next().copied().unwrap_or(0.0);
    let factor = if count == 0.0 { 0.0 } else { 1.0 / count };

    let channels = x.len_of(Axis(1));
    if blobs[0].len() != channels || blobs[1].len() != channels {
        return Err(TransformError::ShapeMismatch(format!(
            "{}: statistics do not match {} channels",
            node.name, channels
        )));
    }

    let mut out = x.clone();
    for ((mut channel, &mean), &var) in out
        .axis_iter_mut(Axis(1))
        .zip(blobs[0].iter())
        .zip(blobs[1].iter())
    {
        let mean = mean * factor;
        let std = (var * factor + eps).sqrt();
        channel.mapv_inplace(|v| (v - mean) / std);
    }
    Ok(out)
}

fn scale(node: &LayerNode, inputs: &[&ArrayD<f32>], blobs: &[ArrayD<f32>]) -> CaffeResult<ArrayD<f32>> {
    let x = first(node, inputs)?;
    let (factor, bias) = match inputs.get(1) {
        Some(factor) => (*factor, blobs.first()),
        None => {
            let factor = blobs.first().ok_or_else(|| {
                TransformError::MissingParameter(format!("{}: scale blob", node.name))
            })?;
            (factor, blobs.get(1))
        }
    };
    let bias = if node.bias_term() { bias } else { None };

    let axis = node
        .kind_param()
        .and_then(|p| p.get_parsed::<i64>("axis"))
        .unwrap_or(1);
    let axis = canonical_axis(node, axis, x.ndim())?;

    // Span the axes whose sizes multiply to the factor's length
    let shape = x.shape();
    let outer: usize = shape[..axis].iter().product();
    let mut span_end = axis;
    let mut span = 1;
    while span < factor.len() && span_end < shape.len() {
        span *= shape[span_end];
        span_end += 1;
    }
    if span != factor.len() {
        return Err(TransformError::ShapeMismatch(format!(
            "{}: scale of {} values does not fit input {:?} at axis {}",
            node.name,
            factor.len(),
            shape,
            axis
        )));
    }
    let inner: usize = shape[span_end..].iter().product();

    let factor: Vec<f32> = factor.iter().copied().collect();
    let bias: Option<Vec<f32>> = bias.map(|b| b.iter().copied().collect());
    if let Some(b) = &bias {
        if b.len() != span {
            return Err(TransformError::ShapeMismatch(format!(
                "{}: bias has {} values for a scale of {}",
                node.name,
                b.len(),
                span
            )));
        }
    }

    let mut data: Vec<f32> = x.iter().copied().collect();
    for o in 0..outer {
        for (k, &f) in factor.iter().enumerate() {
            let offset = bias.as_ref().map(|b| b[k]).unwrap_or(0.0);
            let start = (o * span + k) * inner;
            for v in &mut data[start..start + inner] {
                *v = *v * f + offset;
            }
        }
    }

    Array::from_shape_vec(IxDyn(shape), data).map_err(|e| TransformError::Internal(e.to_string()))
}

// ============================================================================
// Activations
// ============================================================================

fn relu(node: &LayerNode, x: &ArrayD<f32>) -> ArrayD<f32> {
    let slope = layer_param(node, "relu_param")
        .and_then(|p| p.get_parsed::<f32>("negative_slope"))
        .unwrap_or(0.0);
    x.mapv(|v| if v > 0.0 { v } else { v * slope })
}

fn softmax(node: &LayerNode, x: &ArrayD<f32>) -> CaffeResult<ArrayD<f32>> {
    let axis = layer_param(node, "softmax_param")
        .and_then(|p| p.get_parsed::<i64>("axis"))
        .unwrap_or(1);
    let axis = canonical_axis(node, axis, x.ndim())?;

    let mut out = x.clone();
    for mut lane in out.lanes_mut(Axis(axis)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    Ok(out)
}

// ============================================================================
// Pooling
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum PoolMethod {
    Max,
    Average,
}

fn pooled_size(size: usize, kernel: usize, pad: usize, stride: usize) -> usize {
    // Caffe rounds up, then drops a window that would start in the padding
    let mut out = (size + 2 * pad - kernel).div_ceil(stride) + 1;
    if pad > 0 && (out - 1) * stride >= size + pad {
        out -= 1;
    }
    out
}

fn pooling(node: &LayerNode, x: &ArrayD<f32>) -> CaffeResult<ArrayD<f32>> {
    let param = layer_param(node, "pooling_param");
    let x = as_4d(node, x)?;
    let (batch, channels, height, width) = x.dim();

    let method = match param.and_then(|p| p.get("pool")).and_then(|v| v.as_raw()) {
        None | Some("MAX") | Some("0") => PoolMethod::Max,
        Some("AVE") | Some("1") => PoolMethod::Average,
        Some(other) => {
            return Err(TransformError::UnsupportedLayer {
                name: node.name.clone(),
                layer_type: format!("Pooling ({})", other),
            })
        }
    };

    let global = param
        .and_then(|p| p.get_bool("global_pooling"))
        .unwrap_or(false);
    let ((kh, kw), (ph, pw), (sh, sw)) = if global {
        ((height, width), (0, 0), (1, 1))
    } else {
        (
            spatial_pair(node, param, "kernel", None)?,
            spatial_pair(node, param, "pad", Some(0))?,
            spatial_pair(node, param, "stride", Some(1))?,
        )
    };

    if kh == 0 || kw == 0 || sh == 0 || sw == 0 || height + 2 * ph < kh || width + 2 * pw < kw {
        return Err(TransformError::ShapeMismatch(format!(
            "{}: pooling window {}x{} does not fit input {}x{}",
            node.name, kh, kw, height, width
        )));
    }

    let oh = pooled_size(height, kh, ph, sh);
    let ow = pooled_size(width, kw, pw, sw);
    let mut output = Array4::<f32>::zeros((batch, channels, oh, ow));

    for b in 0..batch {
        for c in 0..channels {
            let plane = x.slice(s![b, c, .., ..]);
            for oy in 0..oh {
                let y0 = (oy * sh) as isize - ph as isize;
                let y1 = (y0 + kh as isize).min((height + ph) as isize);
                for ox in 0..ow {
                    let x0 = (ox * sw) as isize - pw as isize;
                    let x1 = (x0 + kw as isize).min((width + pw) as isize);
                    let pool_size = ((y1 - y0) * (x1 - x0)) as f32;

                    let (ys, ye) = (y0.max(0) as usize, (y1.min(height as isize)) as usize);
                    let (xs, xe) = (x0.max(0) as usize, (x1.min(width as isize)) as usize);
                    let window = plane.slice(s![ys..ye, xs..xe]);

                    output[[b, c, oy, ox]] = match method {
                        PoolMethod::Max => window.fold(f32::MIN, |m, &v| m.max(v)),
                        PoolMethod::Average => window.sum() / pool_size,
                    };
                }
            }
        }
    }

    Ok(output.into_dyn())
}

// ============================================================================
// Dense layers
// ============================================================================

fn inner_product(
    node: &LayerNode,
    x: &ArrayD<f32>,
    blobs: &[ArrayD<f32>],
) -> CaffeResult<ArrayD<f32>> {
    let param = layer_param(node, "inner_product_param");
    let axis = param.and_then(|p| p.get_parsed::<i64>("axis")).unwrap_or(1);
    let axis = canonical_axis(node, axis, x.ndim())?;
    let transpose = param.and_then(|p| p.get_bool("transpose")).unwrap_or(false);
    let bias_term = param.and_then(|p| p.get_bool("bias_term")).unwrap_or(true);

    let rows: usize = x.shape()[..axis].iter().product();
    let depth: usize = x.shape()[axis..].iter().product();

    let weight = blobs
        .first()
        .ok_or_else(|| TransformError::MissingParameter(format!("{}: weight", node.name)))?;
    if depth == 0 || weight.len() % depth != 0 {
        return Err(TransformError::ShapeMismatch(format!(
            "{}: weight of {} values does not fit input depth {}",
            node.name,
            weight.len(),
            depth
        )));
    }
    let outputs = weight.len() / depth;

    let input = Array2::from_shape_vec((rows, depth), x.iter().copied().collect())
        .map_err(|e| TransformError::Internal(e.to_string()))?;
    let weight_values: Vec<f32> = weight.iter().copied().collect();

    let mut result = if transpose {
        let w = Array2::from_shape_vec((depth, outputs), weight_values)
            .map_err(|e| TransformError::Internal(e.to_string()))?;
        input.dot(&w)
    } else {
        let w = Array2::from_shape_vec((outputs, depth), weight_values)
            .map_err(|e| TransformError::Internal(e.to_string()))?;
        input.dot(&w.t())
    };

    if bias_term {
        if let Some(bias) = blobs.get(1) {
            if bias.len() != outputs {
                return Err(TransformError::ShapeMismatch(format!(
                    "{}: bias has {} values for {} outputs",
                    node.name,
                    bias.len(),
                    outputs
                )));
            }
            for mut row in result.rows_mut() {
                for (v, &b) in row.iter_mut().zip(bias.iter()) {
                    *v += b;
                }
            }
        }
    }

    let mut shape = x.shape()[..axis].to_vec();
    shape.push(outputs);
    result
        .into_shape(IxDyn(&shape))
        .map_err(|e| TransformError::Internal(e.to_string()))
}

// ============================================================================
// Multi-input and shape layers
// ============================================================================

fn eltwise(node: &LayerNode, inputs: &[&ArrayD<f32>]) -> CaffeResult<ArrayD<f32>> {
    let param = layer_param(node, "eltwise_param");
    let x = first(node, inputs)?;
    if let Some(other) = inputs.iter().find(|a| a.shape() != x.shape()) {
        return Err(TransformError::ShapeMismatch(format!(
            "{}: {:?} vs {:?}",
            node.name,
            x.shape(),
            other.shape()
        )));
    }

    let operation = param
        .and_then(|p| p.get("operation"))
        .and_then(|v| v.as_raw())
        .unwrap_or("SUM");

    match operation {
        "SUM" | "1" => {
            let coeffs: Vec<f32> = param.map(|p| p.get_parsed_all("coeff")).unwrap_or_default();
            if !coeffs.is_empty() && coeffs.len() != inputs.len() {
                return Err(TransformError::InvalidLayer(format!(
                    "{}: {} coefficients for {} inputs",
                    node.name,
                    coeffs.len(),
                    inputs.len()
                )));
            }
            let mut out = ArrayD::<f32>::zeros(x.raw_dim());
            for (i, input) in inputs.iter().enumerate() {
                let coeff = coeffs.get(i).copied().unwrap_or(1.0);
                out.scaled_add(coeff, *input);
            }
            Ok(out)
        }
        "PROD" | "0" => {
            let mut out = x.clone();
            for input in &inputs[1..] {
                out *= *input;
            }
            Ok(out)
        }
        "MAX" | "2" => {
            let mut out = x.clone();
            for input in &inputs[1..] {
                out.zip_mut_with(*input, |a, &b| *a = a.max(b));
            }
            Ok(out)
        }
        other => Err(TransformError::UnsupportedLayer {
            name: node.name.clone(),
            layer_type: format!("Eltwise ({})", other),
        }),
    }
}

fn concat(node: &LayerNode, inputs: &[&ArrayD<f32>]) -> CaffeResult<ArrayD<f32>> {
    let x = first(node, inputs)?;
    let param = layer_param(node, "concat_param");
    let axis = param
        .and_then(|p| p.get_parsed::<i64>("axis").or_else(|| p.get_parsed::<i64>("concat_dim")))
        .unwrap_or(1);
    let axis = canonical_axis(node, axis, x.ndim())?;

    let views: Vec<_> = inputs.iter().map(|a| a.view()).collect();
    concatenate(Axis(axis), &views)
        .map_err(|e| TransformError::ShapeMismatch(format!("{}: {}", node.name, e)))
}

fn flatten(node: &LayerNode, x: &ArrayD<f32>) -> CaffeResult<ArrayD<f32>> {
    let param = layer_param(node, "flatten_param");
    let axis = param.and_then(|p| p.get_parsed::<i64>("axis")).unwrap_or(1);
    let end_axis = param.and_then(|p| p.get_parsed::<i64>("end_axis")).unwrap_or(-1);
    let axis = canonical_axis(node, axis, x.ndim())?;
    let end_axis = canonical_axis(node, end_axis, x.ndim())?;
    if end_axis < axis {
        return Err(TransformError::InvalidLayer(format!(
            "{}: end_axis before axis",
            node.name
        )));
    }

    let shape = x.shape();
    let mut new_shape = shape[..axis].to_vec();
    new_shape.push(shape[axis..=end_axis].iter().product());
    new_shape.extend_from_slice(&shape[end_axis + 1..]);

    Array::from_shape_vec(IxDyn(&new_shape), x.iter().copied().collect())
        .map_err(|e| TransformError::Internal(e.to_string()))
}
