//! Layer capability and ordered composition.
//!
//! Every building block of the network implements [`Layer`]: a pure tensor
//! transform plus static shape inference and an export descriptor. Shapes are
//! checked through [`Layer::output_shape`] before any tensor work, so a
//! mismatched input surfaces as [`Connect4NetError::ShapeMismatch`] instead of
//! a libtorch panic.

use serde::{Deserialize, Serialize};
use std::fmt;
use tch::{nn, Kind, Tensor};

use crate::{Connect4NetError, Result};

/// Export-level description of a single layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LayerOp {
    Conv2d {
        in_channels: i64,
        out_channels: i64,
        kernel_size: i64,
        padding: i64,
    },
    Relu,
    Flatten,
    Linear {
        in_features: i64,
        out_features: i64,
    },
    /// Exp-normalization over every axis after the first.
    SpatialSoftmax,
    Sequential {
        name: String,
        layers: Vec<LayerOp>,
    },
}

impl LayerOp {
    /// Interchange-format op name this layer lowers to.
    pub fn name(&self) -> &'static str {
        match self {
            LayerOp::Conv2d { .. } => "Conv",
            LayerOp::Relu => "Relu",
            LayerOp::Flatten => "Flatten",
            LayerOp::Linear { .. } => "Gemm",
            LayerOp::SpatialSoftmax => "Softmax",
            LayerOp::Sequential { .. } => "Sequential",
        }
    }

    /// Lowest opset at which the lowered op has the semantics used here.
    ///
    /// Softmax is applied to the `[batch, H*W]` flattening, which every
    /// revision normalizes along axis 1. Gemm only broadcasts its bias
    /// without an attribute from opset 7.
    pub fn min_opset(&self) -> u32 {
        match self {
            LayerOp::Conv2d { .. } => 1,
            LayerOp::Relu => 1,
            LayerOp::Flatten => 1,
            LayerOp::SpatialSoftmax => 1,
            LayerOp::Linear { .. } => 7,
            LayerOp::Sequential { layers, .. } => {
                layers.iter().map(LayerOp::min_opset).max().unwrap_or(1)
            }
        }
    }

    /// Leaf ops in evaluation order.
    pub fn leaves(&self) -> Vec<&LayerOp> {
        match self {
            LayerOp::Sequential { layers, .. } => layers.iter().flat_map(LayerOp::leaves).collect(),
            op => vec![op],
        }
    }
}

/// A pure tensor transform with static shape inference.
///
/// Not `Sync`: libtorch tensors are only guaranteed `Send`.
pub trait Layer: Send + fmt::Debug {
    fn forward(&self, xs: &Tensor) -> Tensor;

    /// Shape this layer produces for `input`, or `ShapeMismatch`.
    fn output_shape(&self, input: &[i64]) -> Result<Vec<i64>>;

    fn op(&self) -> LayerOp;
}

fn mismatch(context: &str, expected: impl Into<String>, actual: &[i64]) -> Connect4NetError {
    Connect4NetError::ShapeMismatch {
        context: context.to_string(),
        expected: expected.into(),
        actual: actual.to_vec(),
    }
}

/// 2D convolution with "same" padding. Only odd kernels keep the spatial
/// size symmetric, so construction requires one.
#[derive(Debug)]
pub struct Conv2dSame {
    conv: nn::Conv2D,
    in_channels: i64,
    out_channels: i64,
    kernel_size: i64,
}

impl Conv2dSame {
    pub fn new(path: &nn::Path, in_channels: i64, out_channels: i64, kernel_size: i64) -> Result<Self> {
        if kernel_size <= 0 || kernel_size % 2 == 0 {
            return Err(Connect4NetError::InvalidConfig(format!(
                "same padding needs an odd kernel size, got {kernel_size}"
            )));
        }
        let conv = nn::conv2d(
            path,
            in_channels,
            out_channels,
            kernel_size,
            nn::ConvConfig {
                padding: kernel_size / 2,
                ..Default::default()
            },
        );
        Ok(Self {
            conv,
            in_channels,
            out_channels,
            kernel_size,
        })
    }
}

impl Layer for Conv2dSame {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.conv)
    }

    fn output_shape(&self, input: &[i64]) -> Result<Vec<i64>> {
        match input {
            [batch, channels, height, width] if *channels == self.in_channels => {
                Ok(vec![*batch, self.out_channels, *height, *width])
            }
            _ => Err(mismatch(
                "conv2d",
                format!("[batch, {}, height, width]", self.in_channels),
                input,
            )),
        }
    }

    fn op(&self) -> LayerOp {
        LayerOp::Conv2d {
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            kernel_size: self.kernel_size,
            padding: self.kernel_size / 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl Layer for Relu {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.relu()
    }

    fn output_shape(&self, input: &[i64]) -> Result<Vec<i64>> {
        Ok(input.to_vec())
    }

    fn op(&self) -> LayerOp {
        LayerOp::Relu
    }
}

/// Collapses every axis after the batch axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl Layer for Flatten {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.flatten(1, -1)
    }

    fn output_shape(&self, input: &[i64]) -> Result<Vec<i64>> {
        match input {
            [batch, rest @ ..] if !rest.is_empty() => Ok(vec![*batch, rest.iter().product()]),
            _ => Err(mismatch("flatten", "[batch, ..] with rank >= 2", input)),
        }
    }

    fn op(&self) -> LayerOp {
        LayerOp::Flatten
    }
}

#[derive(Debug)]
pub struct Linear {
    linear: nn::Linear,
    in_features: i64,
    out_features: i64,
}

impl Linear {
    pub fn new(path: &nn::Path, in_features: i64, out_features: i64) -> Self {
        Self {
            linear: nn::linear(path, in_features, out_features, Default::default()),
            in_features,
            out_features,
        }
    }
}

impl Layer for Linear {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.linear)
    }

    fn output_shape(&self, input: &[i64]) -> Result<Vec<i64>> {
        match input {
            [batch, features] if *features == self.in_features => Ok(vec![*batch, self.out_features]),
            _ => Err(mismatch("linear", format!("[batch, {}]", self.in_features), input)),
        }
    }

    fn op(&self) -> LayerOp {
        LayerOp::Linear {
            in_features: self.in_features,
            out_features: self.out_features,
        }
    }
}

/// Exp-normalizes each batch element over all of its remaining axes.
///
/// This is the raw graph op: it does not check for degenerate logits. Use
/// [`crate::neural::policy_norm::normalize_policy`] when the result must be a
/// valid distribution.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpatialSoftmax;

impl Layer for SpatialSoftmax {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.flatten(1, -1).softmax(-1, Kind::Float).view_as(xs)
    }

    fn output_shape(&self, input: &[i64]) -> Result<Vec<i64>> {
        if input.len() < 2 {
            return Err(mismatch("spatial softmax", "[batch, ..] with rank >= 2", input));
        }
        Ok(input.to_vec())
    }

    fn op(&self) -> LayerOp {
        LayerOp::SpatialSoftmax
    }
}

/// Ordered composition: each layer feeds the next.
#[derive(Debug)]
pub struct Sequential {
    name: String,
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: Vec::new(),
        }
    }

    pub fn add<L: Layer + 'static>(mut self, layer: L) -> Self {
        self.layers.push(Box::new(layer));
        self
    }
}

impl Layer for Sequential {
    fn forward(&self, xs: &Tensor) -> Tensor {
        self.layers
            .iter()
            .fold(xs.shallow_clone(), |h, layer| layer.forward(&h))
    }

    fn output_shape(&self, input: &[i64]) -> Result<Vec<i64>> {
        self.layers
            .iter()
            .try_fold(input.to_vec(), |shape, layer| layer.output_shape(&shape))
            .map_err(|err| match err {
                Connect4NetError::ShapeMismatch {
                    context,
                    expected,
                    actual,
                } => Connect4NetError::ShapeMismatch {
                    context: format!("{}/{}", self.name, context),
                    expected,
                    actual,
                },
                other => other,
            })
    }

    fn op(&self) -> LayerOp {
        LayerOp::Sequential {
            name: self.name.clone(),
            layers: self.layers.iter().map(|layer| layer.op()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tch::Device;

    #[test]
    fn test_conv_same_keeps_spatial_size() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = Conv2dSame::new(&(vs.root() / "conv"), 2, 6, 5).unwrap();

        let input = Tensor::rand([3, 2, 8, 7], (Kind::Float, Device::Cpu));
        let output = conv.forward(&input);

        assert_eq!(output.size(), vec![3, 6, 8, 7]);
        assert_eq!(conv.output_shape(&[3, 2, 8, 7]).unwrap(), vec![3, 6, 8, 7]);
    }

    #[test]
    fn test_conv_rejects_even_kernel() {
        let vs = nn::VarStore::new(Device::Cpu);
        let conv = Conv2dSame::new(&(vs.root() / "conv"), 2, 6, 4);
        assert_matches!(conv, Err(Connect4NetError::InvalidConfig(_)));
    }

    #[test]
    fn test_sequential_reports_failing_block() {
        let vs = nn::VarStore::new(Device::Cpu);
        let seq = Sequential::new("trunk")
            .add(Conv2dSame::new(&(vs.root() / "c0"), 2, 6, 3).unwrap())
            .add(Relu);

        let err = seq.output_shape(&[1, 3, 8, 7]).unwrap_err();
        assert_matches!(
            err,
            Connect4NetError::ShapeMismatch { ref context, ref actual, .. }
                if context == "trunk/conv2d" && actual == &vec![1, 3, 8, 7]
        );
    }

    #[test]
    fn test_flatten_then_linear_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let seq = Sequential::new("value")
            .add(Flatten)
            .add(Linear::new(&(vs.root() / "fc"), 6 * 8 * 7, 30));

        assert_eq!(seq.output_shape(&[4, 6, 8, 7]).unwrap(), vec![4, 30]);
        assert!(seq.output_shape(&[4, 6, 8, 6]).is_err());
    }

    #[test]
    fn test_spatial_softmax_rows_sum_to_one() {
        let logits = Tensor::randn([2, 1, 8, 7], (Kind::Float, Device::Cpu));
        let probs = SpatialSoftmax.forward(&logits);

        assert_eq!(probs.size(), vec![2, 1, 8, 7]);
        let values = Vec::<f32>::try_from(&probs.flatten(0, -1)).unwrap();
        for row in values.chunks(8 * 7) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_min_opset_of_sequence_is_max_of_leaves() {
        let policy = LayerOp::Sequential {
            name: "policy".into(),
            layers: vec![LayerOp::Relu, LayerOp::SpatialSoftmax, LayerOp::Flatten],
        };
        assert_eq!(policy.min_opset(), 1);
        assert_eq!(policy.leaves().len(), 3);

        let value = LayerOp::Sequential {
            name: "value".into(),
            layers: vec![
                LayerOp::Flatten,
                LayerOp::Linear {
                    in_features: 336,
                    out_features: 30,
                },
                LayerOp::Relu,
            ],
        };
        assert_eq!(value.min_opset(), 7);
    }
}
