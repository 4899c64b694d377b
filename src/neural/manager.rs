//! Neural Network Manager
//!
//! Owns the parameter store and the dual-head network built on it.
//! Handles configuration, device selection and seeded initialization.

use rand::{rng, RngExt};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use tch::{nn, Device, Tensor};

use crate::neural::dual_head_net::{initialize_weights, DualHeadNet, NetworkOutput};
use crate::{Connect4NetError, Result};

/// Shape of the dual-head network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Input planes (side to move, opponent)
    pub input_channels: i64,
    /// Channels produced by every trunk convolution
    pub trunk_channels: i64,
    /// Number of conv + ReLU repetitions in the trunk
    pub trunk_depth: usize,
    /// Odd kernel size shared by every convolution
    pub kernel_size: i64,
    /// Hidden units of the value head
    pub value_hidden_width: i64,
    /// Channels of the intermediate policy convolution
    pub policy_hidden_channels: i64,
    pub board_height: i64,
    pub board_width: i64,
    /// Initialization seed; a random one is drawn and logged when absent
    pub seed: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input_channels: 2,
            trunk_channels: 6,
            trunk_depth: 2,
            kernel_size: 5,
            value_hidden_width: 30,
            policy_hidden_channels: 2,
            board_height: 8,
            board_width: 7,
            seed: None,
        }
    }
}

impl NetworkConfig {
    /// Single-convolution trunk variant.
    pub fn shallow() -> Self {
        Self {
            trunk_depth: 1,
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("input_channels", self.input_channels),
            ("trunk_channels", self.trunk_channels),
            ("kernel_size", self.kernel_size),
            ("value_hidden_width", self.value_hidden_width),
            ("policy_hidden_channels", self.policy_hidden_channels),
            ("board_height", self.board_height),
            ("board_width", self.board_width),
        ];
        if let Some((name, value)) = dims.iter().find(|(_, value)| *value <= 0) {
            return Err(Connect4NetError::InvalidConfig(format!(
                "{name} must be positive, got {value}"
            )));
        }
        if self.trunk_depth == 0 {
            return Err(Connect4NetError::InvalidConfig(
                "trunk_depth must be at least 1".to_string(),
            ));
        }
        if self.kernel_size % 2 == 0 {
            return Err(Connect4NetError::InvalidConfig(format!(
                "same padding needs an odd kernel size, got {}",
                self.kernel_size
            )));
        }
        Ok(())
    }

    /// Input shape for a given batch size.
    pub fn input_shape(&self, batch: i64) -> [i64; 4] {
        [batch, self.input_channels, self.board_height, self.board_width]
    }
}

/// Where the parameters live. Chosen by the caller, never probed implicitly
/// except through `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceChoice {
    /// CUDA device 0 when available, CPU otherwise
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Mps,
}

impl DeviceChoice {
    pub fn resolve(self) -> Device {
        match self {
            DeviceChoice::Auto => Device::cuda_if_available(),
            DeviceChoice::Cpu => Device::Cpu,
            DeviceChoice::Cuda(index) => Device::Cuda(index),
            DeviceChoice::Mps => Device::Mps,
        }
    }
}

impl FromStr for DeviceChoice {
    type Err = Connect4NetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DeviceChoice::Auto),
            "cpu" => Ok(DeviceChoice::Cpu),
            "mps" => Ok(DeviceChoice::Mps),
            "cuda" => Ok(DeviceChoice::Cuda(0)),
            other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
                Some(Ok(index)) => Ok(DeviceChoice::Cuda(index)),
                _ => Err(Connect4NetError::InvalidConfig(format!(
                    "unknown device '{s}', expected auto, cpu, mps, cuda or cuda:N"
                ))),
            },
        }
    }
}

/// Parameter store plus the network registered on it.
#[derive(Debug)]
pub struct NeuralManager {
    config: NetworkConfig,
    seed: u64,
    vs: nn::VarStore,
    net: DualHeadNet,
    fixed_batch: Option<i64>,
}

impl NeuralManager {
    /// Default network on CPU.
    pub fn new() -> Result<Self> {
        Self::with_config(NetworkConfig::default(), DeviceChoice::Cpu)
    }

    pub fn with_config(config: NetworkConfig, device: DeviceChoice) -> Result<Self> {
        log::info!("🧠 Initializing dual-head network...");
        config.validate()?;

        let device = device.resolve();
        let seed = config.seed.unwrap_or_else(|| rng().random_range(0..u64::MAX));
        log::debug!(
            "Network config: {:?}, device={:?}, seed={}",
            config,
            device,
            seed
        );

        let vs = nn::VarStore::new(device);
        let net = DualHeadNet::new(&vs.root(), &config)?;
        initialize_weights(&vs, seed)?;

        log::info!(
            "✅ Network ready: {} tensors, {} parameters",
            vs.variables().len(),
            parameter_count(&vs)
        );

        Ok(Self {
            config,
            seed,
            vs,
            net,
            fixed_batch: None,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Seed the parameters were drawn from.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn net(&self) -> &DualHeadNet {
        &self.net
    }

    pub fn varstore(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn varstore_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    /// Pins the batch axis: `evaluate` then rejects any other batch size.
    pub fn with_fixed_batch(mut self, batch: i64) -> Self {
        self.fixed_batch = Some(batch);
        self
    }

    pub fn fixed_batch(&self) -> Option<i64> {
        self.fixed_batch
    }

    /// Inference forward pass without gradient tracking.
    pub fn evaluate(&self, input: &Tensor) -> Result<NetworkOutput> {
        if let Some(batch) = self.fixed_batch {
            let size = input.size();
            if size.first() != Some(&batch) {
                let [_, channels, height, width] = self.config.input_shape(batch);
                return Err(Connect4NetError::ShapeMismatch {
                    context: "input".to_string(),
                    expected: format!("[{batch}, {channels}, {height}, {width}]"),
                    actual: size,
                });
            }
        }
        tch::no_grad(|| self.net.forward(input))
    }

    pub fn summary(&self) -> NeuralSummary {
        NeuralSummary {
            input_shape: self.config.input_shape(1),
            trunk_depth: self.config.trunk_depth,
            device: format!("{:?}", self.device()),
            seed: self.seed,
            tensors: self.vs.variables().len(),
            parameters: parameter_count(&self.vs),
        }
    }
}

fn parameter_count(vs: &nn::VarStore) -> i64 {
    vs.variables()
        .values()
        .map(|t| t.size().iter().product::<i64>())
        .sum()
}

#[derive(Debug)]
pub struct NeuralSummary {
    pub input_shape: [i64; 4],
    pub trunk_depth: usize,
    pub device: String,
    pub seed: u64,
    pub tensors: usize,
    pub parameters: i64,
}

impl std::fmt::Display for NeuralSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Dual-Head Network Summary:\n\
             📐 Input Shape: [batch, {}, {}, {}]\n\
             🧱 Trunk Depth: {}\n\
             💻 Device: {}\n\
             🎲 Seed: {}\n\
             🔢 Tensors: {}, Parameters: {}",
            self.input_shape[1],
            self.input_shape[2],
            self.input_shape[3],
            self.trunk_depth,
            self.device,
            self.seed,
            self.tensors,
            self.parameters
        )
    }
}
