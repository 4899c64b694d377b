use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use tch::{nn, Device, Kind, Tensor};

use crate::neural::layers::{Conv2dSame, Flatten, Layer, LayerOp, Linear, Relu, Sequential};
use crate::neural::manager::NetworkConfig;
use crate::neural::policy_norm::normalize_policy;
use crate::{Connect4NetError, Result};

/// Result of one forward pass.
#[derive(Debug)]
pub struct NetworkOutput {
    /// `[batch, 1]`, unbounded position evaluation.
    pub value: Tensor,
    /// `[batch, 1, height, width]`, non-negative and summing to 1 per batch element.
    pub policy: Tensor,
}

/// Convolutional trunk shared by a value head and a policy head.
///
/// ```text
/// input ─ trunk ─┬─ value head  ─ value  [B, 1]
///                └─ policy head ─ logits [B, 1, H, W] ─ normalize ─ policy
/// ```
#[derive(Debug)]
pub struct DualHeadNet {
    config: NetworkConfig,
    device: Device,
    trunk: Sequential,
    value_head: Sequential,
    policy_head: Sequential,
}

impl DualHeadNet {
    /// Registers every parameter under `path`: `trunk.*`, `value.*`, `policy.*`.
    pub fn new(path: &nn::Path, config: &NetworkConfig) -> Result<Self> {
        config.validate()?;
        let k = config.kernel_size;

        let trunk_path = path / "trunk";
        let mut trunk = Sequential::new("trunk");
        let mut channels = config.input_channels;
        for idx in 0..config.trunk_depth {
            trunk = trunk
                .add(Conv2dSame::new(
                    &(&trunk_path / format!("conv{idx}")),
                    channels,
                    config.trunk_channels,
                    k,
                )?)
                .add(Relu);
            channels = config.trunk_channels;
        }

        let flatten_size = config.trunk_channels * config.board_height * config.board_width;
        log::debug!(
            "🔧 Value head flatten_size: {} (channels={}, height={}, width={})",
            flatten_size,
            config.trunk_channels,
            config.board_height,
            config.board_width
        );
        let value_path = path / "value";
        let value_head = Sequential::new("value")
            .add(Flatten)
            .add(Linear::new(&(&value_path / "fc1"), flatten_size, config.value_hidden_width))
            .add(Relu)
            .add(Linear::new(&(&value_path / "fc2"), config.value_hidden_width, 1));

        let policy_path = path / "policy";
        let policy_head = Sequential::new("policy")
            .add(Conv2dSame::new(
                &(&policy_path / "conv1"),
                config.trunk_channels,
                config.policy_hidden_channels,
                k,
            )?)
            .add(Relu)
            .add(Conv2dSame::new(
                &(&policy_path / "conv2"),
                config.policy_hidden_channels,
                1,
                k,
            )?);

        Ok(Self {
            config: config.clone(),
            device: path.device(),
            trunk,
            value_head,
            policy_head,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Device holding the parameters.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Computes `(value, policy)` from a `[batch, channels, height, width]` grid.
    ///
    /// Both heads read the same trunk activation. The input is moved to the
    /// parameters' device and cast to `f32`.
    pub fn forward(&self, input: &Tensor) -> Result<NetworkOutput> {
        self.check_input(&input.size())?;
        let input = input.to_device(self.device).to_kind(Kind::Float);

        let common = self.trunk.forward(&input);
        let value = self.value_head.forward(&common);
        let policy_logits = self.policy_head.forward(&common);
        let policy = normalize_policy(&policy_logits)?;

        Ok(NetworkOutput { value, policy })
    }

    /// Validates an input shape and returns the `(trunk, value, policy logits)` shapes.
    pub fn infer_shapes(&self, input: &[i64]) -> Result<(Vec<i64>, Vec<i64>, Vec<i64>)> {
        self.check_input(input)?;
        let common = self.trunk.output_shape(input)?;
        let value = self.value_head.output_shape(&common)?;
        let policy = self.policy_head.output_shape(&common)?;
        Ok((common, value, policy))
    }

    /// Export descriptors, in the order the graph evaluates them.
    pub fn blocks(&self) -> Vec<LayerOp> {
        vec![
            self.trunk.op(),
            self.value_head.op(),
            self.policy_head.op(),
            LayerOp::Sequential {
                name: "policy_norm".to_string(),
                layers: vec![LayerOp::SpatialSoftmax],
            },
        ]
    }

    fn check_input(&self, size: &[i64]) -> Result<()> {
        let expected = [
            self.config.input_channels,
            self.config.board_height,
            self.config.board_width,
        ];
        match size {
            [batch, rest @ ..] if *batch > 0 && rest == expected => Ok(()),
            _ => Err(Connect4NetError::ShapeMismatch {
                context: "input".to_string(),
                expected: format!(
                    "[batch, {}, {}, {}]",
                    expected[0], expected[1], expected[2]
                ),
                actual: size.to_vec(),
            }),
        }
    }
}

/// Xavier-uniform weights and zero biases, drawn from `seed`.
///
/// Values come from a local generator so two stores initialized with the same
/// seed hold identical parameters whatever else touches libtorch's global RNG.
pub fn initialize_weights(vs: &nn::VarStore, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);

    // Sorted so the draw order does not depend on hash map iteration.
    let mut variables: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, mut param) in variables {
        let size = param.size();
        let numel: i64 = size.iter().product();

        let values: Vec<f32> = match size.len() {
            4 | 2 => {
                let receptive: i64 = size[2..].iter().product();
                let fan_in = (size[1] * receptive) as f64;
                let fan_out = (size[0] * receptive) as f64;
                let bound = (6.0 / (fan_in + fan_out)).sqrt() as f32;
                (0..numel).map(|_| rng.random_range(-bound..bound)).collect()
            }
            _ => vec![0.0; numel as usize],
        };

        let init = Tensor::from_slice(&values).view(size.as_slice());
        tch::no_grad(|| param.f_copy_(&init))?;

        if param.isnan().any().double_value(&[]) > 0.0 {
            log::error!("🚨 NaN detected in {} after initialization!", name);
        }
    }
    Ok(())
}
