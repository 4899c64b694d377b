pub mod dual_head_net;
pub mod export;
pub mod layers;
pub mod manager;
pub mod model_io;
pub mod policy_norm;
pub mod tensor_conversion;

// Re-export key components for convenience
pub use dual_head_net::{DualHeadNet, NetworkOutput};
pub use export::{ExportOptions, Exporter, SafetensorsExporter};
pub use manager::{DeviceChoice, NetworkConfig, NeuralManager};
