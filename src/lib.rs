//! # Connect4 Net
//!
//! Dual-head value/policy network for a connect-four style board, built on
//! libtorch through `tch`.
//!
//! ## Features
//!
//! - **Network**: shared convolutional trunk feeding a value head and a policy head
//! - **Layers**: composable [`neural::layers::Layer`] blocks with static shape checks
//! - **Export**: self-describing safetensors graph files with a dynamic batch axis
//! - **Encoding**: board positions as side-to-move / opponent occupancy planes
//!
//! ## Usage
//!
//! ```no_run
//! use connect4_net::neural::{DeviceChoice, NetworkConfig, NeuralManager};
//! use tch::{Device, Kind, Tensor};
//!
//! let manager = NeuralManager::with_config(NetworkConfig::default(), DeviceChoice::Cpu)?;
//! let input = Tensor::ones([5, 2, 8, 7], (Kind::Float, Device::Cpu));
//! let output = manager.evaluate(&input)?;
//! assert_eq!(output.policy.size(), vec![5, 1, 8, 7]);
//! # Ok::<(), connect4_net::Connect4NetError>(())
//! ```

/// Board representation used to build example inputs
pub mod game;

/// Network definition, evaluation and export
pub mod neural;

/// Logger setup for binaries
pub mod logging;

pub use neural::{DeviceChoice, DualHeadNet, NetworkConfig, NetworkOutput, NeuralManager};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Main error type for the connect4_net library
#[derive(Debug, thiserror::Error)]
pub enum Connect4NetError {
    #[error("Shape mismatch in {context}: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: Vec<i64>,
    },

    #[error("Numeric instability: policy logits of batch element {batch_index} cannot be normalized")]
    NumericInstability { batch_index: usize },

    #[error("Export incompatibility: {op} has no equivalent at opset {opset}")]
    ExportIncompatibility { op: String, opset: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid move: {0}")]
    InvalidMove(String),

    #[error("Model format error: {0}")]
    ModelFormat(String),

    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Connect4NetError>;

// ============================================================================
// LIBRARY VERSION INFO
// ============================================================================

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Library description
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
