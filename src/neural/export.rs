//! Graph export.
//!
//! An exporter receives the network, an example input and output names, and
//! writes one self-contained file. Only the batch axis may be left symbolic,
//! so the exported graph stays valid for any batch size.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tch::Tensor;

use crate::neural::dual_head_net::DualHeadNet;
use crate::neural::layers::LayerOp;
use crate::neural::manager::{NetworkConfig, NeuralManager};
use crate::neural::model_io::save_varstore;
use crate::{Connect4NetError, Result};

/// Header metadata key holding the JSON [`GraphManifest`].
pub const GRAPH_METADATA_KEY: &str = "connect4_net.graph";
/// Format tag written into every manifest.
pub const GRAPH_FORMAT: &str = "connect4-net/dual-head-v1";
/// Oldest opset in which every op used by the network has the semantics it needs.
pub const MIN_SUPPORTED_OPSET: u32 = 7;
pub const MAX_SUPPORTED_OPSET: u32 = 20;
/// Symbolic name of a dynamic batch axis.
pub const BATCH_AXIS_NAME: &str = "batch_size";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    pub input_names: Vec<String>,
    /// Value output first, policy second
    pub output_names: Vec<String>,
    /// Leave the batch axis symbolic instead of fixing it to the example's
    pub dynamic_batch_axis: bool,
    pub opset_version: u32,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            input_names: vec!["input".to_string()],
            output_names: vec!["value".to_string(), "policy".to_string()],
            dynamic_batch_axis: true,
            opset_version: 16,
        }
    }
}

impl ExportOptions {
    fn validate(&self) -> Result<()> {
        if self.input_names.len() != 1 || self.output_names.len() != 2 {
            return Err(Connect4NetError::InvalidConfig(format!(
                "expected 1 input name and 2 output names, got {} and {}",
                self.input_names.len(),
                self.output_names.len()
            )));
        }
        let mut seen = HashSet::new();
        for name in self.input_names.iter().chain(&self.output_names) {
            if name.is_empty() || !seen.insert(name.as_str()) {
                return Err(Connect4NetError::InvalidConfig(format!(
                    "tensor names must be non-empty and unique, got '{name}'"
                )));
            }
        }
        Ok(())
    }
}

/// One axis of an exported tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dim {
    Fixed(i64),
    Symbolic(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<Dim>,
}

impl TensorSpec {
    fn new(name: &str, shape: &[i64], dynamic_batch_axis: bool) -> Self {
        let shape = shape
            .iter()
            .enumerate()
            .map(|(axis, &size)| match axis {
                0 if dynamic_batch_axis => Dim::Symbolic(BATCH_AXIS_NAME.to_string()),
                _ => Dim::Fixed(size),
            })
            .collect();
        Self {
            name: name.to_string(),
            shape,
        }
    }
}

/// Everything needed to rebuild and run the exported graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphManifest {
    pub format: String,
    pub opset_version: u32,
    pub config: NetworkConfig,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub blocks: Vec<LayerOp>,
    pub exported_at: String,
}

impl GraphManifest {
    pub(crate) fn check_format(&self) -> Result<()> {
        if self.format != GRAPH_FORMAT {
            return Err(Connect4NetError::ModelFormat(format!(
                "unknown graph format '{}', expected '{GRAPH_FORMAT}'",
                self.format
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub path: PathBuf,
    pub manifest: GraphManifest,
    pub tensors: usize,
}

pub trait Exporter {
    fn export(
        &self,
        model: &NeuralManager,
        example_input: &Tensor,
        output_path: &Path,
        options: &ExportOptions,
    ) -> Result<ExportReport>;
}

/// Ops of `net` that have no equivalent at `opset`.
///
/// Every op is reported when `opset` lies outside the supported range.
pub fn unconvertible_ops(net: &DualHeadNet, opset: u32) -> Vec<LayerOp> {
    let in_range = (MIN_SUPPORTED_OPSET..=MAX_SUPPORTED_OPSET).contains(&opset);
    net.blocks()
        .iter()
        .flat_map(LayerOp::leaves)
        .filter(|op| !in_range || op.min_opset() > opset)
        .cloned()
        .collect()
}

/// Writes parameters as safetensors with the graph manifest in the header.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetensorsExporter;

impl Exporter for SafetensorsExporter {
    fn export(
        &self,
        model: &NeuralManager,
        example_input: &Tensor,
        output_path: &Path,
        options: &ExportOptions,
    ) -> Result<ExportReport> {
        options.validate()?;

        let unconvertible = unconvertible_ops(model.net(), options.opset_version);
        if let Some(op) = unconvertible.first() {
            log::warn!(
                "⚠️ {} op(s) cannot be exported at opset {}: {:?}",
                unconvertible.len(),
                options.opset_version,
                unconvertible.iter().map(LayerOp::name).collect::<Vec<_>>()
            );
            return Err(Connect4NetError::ExportIncompatibility {
                op: op.name().to_string(),
                opset: options.opset_version,
            });
        }

        // Trace once so the recorded shapes are the ones the graph produces.
        let traced = model.evaluate(example_input)?;
        let dynamic = options.dynamic_batch_axis;
        let manifest = GraphManifest {
            format: GRAPH_FORMAT.to_string(),
            opset_version: options.opset_version,
            config: NetworkConfig {
                seed: Some(model.seed()),
                ..model.config().clone()
            },
            inputs: vec![TensorSpec::new(&options.input_names[0], &example_input.size(), dynamic)],
            outputs: vec![
                TensorSpec::new(&options.output_names[0], &traced.value.size(), dynamic),
                TensorSpec::new(&options.output_names[1], &traced.policy.size(), dynamic),
            ],
            blocks: model.net().blocks(),
            exported_at: Utc::now().to_rfc3339(),
        };

        let metadata = HashMap::from([(
            GRAPH_METADATA_KEY.to_string(),
            serde_json::to_string(&manifest)?,
        )]);
        save_varstore(model.varstore(), output_path, Some(metadata))?;

        let tensors = model.varstore().variables().len();
        log::info!(
            "✅ Exported {} tensors to {} (opset {})",
            tensors,
            output_path.display(),
            options.opset_version
        );

        Ok(ExportReport {
            path: output_path.to_path_buf(),
            manifest,
            tensors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::manager::DeviceChoice;
    use assert_matches::assert_matches;
    use tch::{Device, Kind};
    use tempfile::tempdir;

    fn manager() -> NeuralManager {
        let config = NetworkConfig {
            seed: Some(21),
            ..NetworkConfig::default()
        };
        NeuralManager::with_config(config, DeviceChoice::Cpu).unwrap()
    }

    #[test]
    fn test_every_op_converts_in_supported_range() {
        let manager = manager();

        for opset in [7, 11, 12, 13, 16, 20] {
            assert!(unconvertible_ops(manager.net(), opset).is_empty(), "opset {opset}");
        }
    }

    #[test]
    fn test_out_of_range_opset_blocks_everything() {
        let manager = manager();
        let total = manager.net().blocks().iter().flat_map(LayerOp::leaves).count();
        assert_eq!(unconvertible_ops(manager.net(), 99).len(), total);
    }

    #[test]
    fn test_export_rejects_opset_below_supported_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let input = Tensor::ones([1, 2, 8, 7], (Kind::Float, Device::Cpu));
        let options = ExportOptions {
            opset_version: 6,
            ..ExportOptions::default()
        };

        let result = SafetensorsExporter.export(&manager(), &input, &path, &options);

        assert_matches!(
            result,
            Err(Connect4NetError::ExportIncompatibility { ref op, opset: 6 }) if op == "Conv"
        );
        assert!(!path.exists());
    }

    #[test]
    fn test_export_at_opset_11() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let input = Tensor::ones([1, 2, 8, 7], (Kind::Float, Device::Cpu));
        let options = ExportOptions {
            opset_version: 11,
            ..ExportOptions::default()
        };

        let report = SafetensorsExporter.export(&manager(), &input, &path, &options).unwrap();

        assert_eq!(report.manifest.opset_version, 11);
        assert!(path.exists());
    }

    #[test]
    fn test_export_rejects_bad_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let input = Tensor::ones([1, 2, 8, 7], (Kind::Float, Device::Cpu));

        let single_output = ExportOptions {
            output_names: vec!["output".to_string()],
            ..ExportOptions::default()
        };
        assert_matches!(
            SafetensorsExporter.export(&manager(), &input, &path, &single_output),
            Err(Connect4NetError::InvalidConfig(_))
        );

        let duplicate = ExportOptions {
            output_names: vec!["input".to_string(), "policy".to_string()],
            ..ExportOptions::default()
        };
        assert_matches!(
            SafetensorsExporter.export(&manager(), &input, &path, &duplicate),
            Err(Connect4NetError::InvalidConfig(_))
        );
    }

    #[test]
    fn test_manifest_shapes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let input = Tensor::ones([5, 2, 8, 7], (Kind::Float, Device::Cpu));

        let report = SafetensorsExporter
            .export(&manager(), &input, &path, &ExportOptions::default())
            .unwrap();

        let batch = Dim::Symbolic(BATCH_AXIS_NAME.to_string());
        let manifest = &report.manifest;
        assert_eq!(manifest.inputs[0].name, "input");
        assert_eq!(
            manifest.inputs[0].shape,
            vec![batch.clone(), Dim::Fixed(2), Dim::Fixed(8), Dim::Fixed(7)]
        );
        assert_eq!(manifest.outputs[0].shape, vec![batch.clone(), Dim::Fixed(1)]);
        assert_eq!(manifest.outputs[1].name, "policy");
        assert_eq!(manifest.outputs[1].shape.len(), 4);
        assert_eq!(manifest.config.seed, Some(21));
        assert_eq!(report.tensors, 12);
        assert!(path.exists());
    }

    #[test]
    fn test_static_batch_axis_is_recorded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let input = Tensor::ones([3, 2, 8, 7], (Kind::Float, Device::Cpu));
        let options = ExportOptions {
            dynamic_batch_axis: false,
            ..ExportOptions::default()
        };

        let report = SafetensorsExporter.export(&manager(), &input, &path, &options).unwrap();
        assert_eq!(report.manifest.inputs[0].shape[0], Dim::Fixed(3));
    }

    #[test]
    fn test_dim_serializes_as_plain_json() {
        let spec = TensorSpec::new("input", &[5, 2, 8, 7], true);
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"name":"input","shape":["batch_size",2,8,7]}"#);
    }
}
