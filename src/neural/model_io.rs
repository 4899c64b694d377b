//! Model I/O utilities using safetensors format
//!
//! Parameters are stored as little-endian tensors in a safetensors container.
//! Exported models additionally carry their graph manifest in the header
//! metadata, which is enough to rebuild the network without any other input.

use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use safetensors::serialize_to_file;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tch::{nn, Kind, Tensor};

use crate::neural::export::{Dim, GraphManifest, GRAPH_METADATA_KEY};
use crate::neural::manager::{DeviceChoice, NeuralManager};
use crate::{Connect4NetError, Result};

/// Save a VarStore to a safetensors file, with optional header metadata.
pub fn save_varstore(
    vs: &nn::VarStore,
    path: impl AsRef<Path>,
    metadata: Option<HashMap<String, String>>,
) -> Result<()> {
    let mut buffers: Vec<(String, Vec<usize>, Dtype, Vec<u8>)> = Vec::new();
    for (name, tensor) in vs.variables() {
        let shape: Vec<usize> = tensor.size().iter().map(|&x| x as usize).collect();
        let (data, dtype) = tensor_to_bytes(&tensor)?;
        buffers.push((name, shape, dtype, data));
    }

    let mut views: HashMap<String, TensorView<'_>> = HashMap::new();
    for (name, shape, dtype, data) in &buffers {
        views.insert(name.clone(), TensorView::new(*dtype, shape.clone(), data)?);
    }

    serialize_to_file(views, &metadata, path.as_ref())?;
    log::debug!("💾 Wrote {} tensors to {}", buffers.len(), path.as_ref().display());
    Ok(())
}

/// Load a VarStore from a safetensors file.
///
/// Every variable of `vs` must be present with the same shape; extra tensors
/// in the file are ignored.
pub fn load_varstore(vs: &mut nn::VarStore, path: impl AsRef<Path>) -> Result<()> {
    let buffer = fs::read(path.as_ref())?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    copy_into_varstore(vs, &tensors)
}

/// Rebuild a network from a file written by
/// [`SafetensorsExporter`](crate::neural::export::SafetensorsExporter).
pub fn load_exported(path: impl AsRef<Path>, device: DeviceChoice) -> Result<NeuralManager> {
    let path = path.as_ref();
    log::info!("📂 Loading exported network from {}", path.display());

    let buffer = fs::read(path)?;
    let manifest = read_manifest(&buffer)?;
    let tensors = SafeTensors::deserialize(&buffer)?;

    let batch_axis = manifest
        .inputs
        .first()
        .and_then(|input| input.shape.first())
        .ok_or_else(|| {
            Connect4NetError::ModelFormat("manifest declares no input shape".to_string())
        })?;

    let mut manager = NeuralManager::with_config(manifest.config.clone(), device)?;
    copy_into_varstore(manager.varstore_mut(), &tensors)?;
    if let Dim::Fixed(batch) = batch_axis {
        log::info!("📌 Batch axis fixed to {batch}");
        manager = manager.with_fixed_batch(*batch);
    }

    log::info!(
        "✅ Loaded {} (opset {}, exported {})",
        manifest.format,
        manifest.opset_version,
        manifest.exported_at
    );
    Ok(manager)
}

/// Parse the graph manifest from a safetensors header.
pub fn read_manifest(buffer: &[u8]) -> Result<GraphManifest> {
    let (_, metadata) = SafeTensors::read_metadata(buffer)?;
    let raw = metadata
        .metadata()
        .as_ref()
        .and_then(|entries| entries.get(GRAPH_METADATA_KEY))
        .ok_or_else(|| {
            Connect4NetError::ModelFormat(format!("missing '{GRAPH_METADATA_KEY}' metadata"))
        })?;
    let manifest: GraphManifest = serde_json::from_str(raw)?;
    manifest.check_format()?;
    Ok(manifest)
}

fn copy_into_varstore(vs: &mut nn::VarStore, tensors: &SafeTensors) -> Result<()> {
    for (name, mut var) in vs.variables() {
        let view = tensors
            .tensor(&name)
            .map_err(|_| Connect4NetError::ModelFormat(format!("tensor '{name}' not found")))?;
        let loaded = tensor_view_to_tensor(&view)?;

        if loaded.size() != var.size() {
            return Err(Connect4NetError::ShapeMismatch {
                context: name,
                expected: format!("{:?}", var.size()),
                actual: loaded.size(),
            });
        }

        tch::no_grad(|| var.f_copy_(&loaded))?;
    }
    Ok(())
}

fn tensor_to_bytes(tensor: &Tensor) -> Result<(Vec<u8>, Dtype)> {
    // Flatten the tensor for conversion, then get contiguous data on CPU
    let tensor = tensor.to_device(tch::Device::Cpu).flatten(0, -1).contiguous();

    match tensor.kind() {
        Kind::Double => {
            let data: Vec<f64> = Vec::<f64>::try_from(&tensor)?;
            Ok((data.iter().flat_map(|x| x.to_le_bytes()).collect(), Dtype::F64))
        }
        // Half precision is widened so the file stays readable without libtorch
        Kind::Float | Kind::Half | Kind::BFloat16 => {
            let data: Vec<f32> = Vec::<f32>::try_from(&tensor.to_kind(Kind::Float))?;
            Ok((data.iter().flat_map(|x| x.to_le_bytes()).collect(), Dtype::F32))
        }
        kind => Err(Connect4NetError::ModelFormat(format!(
            "unsupported tensor kind: {kind:?}"
        ))),
    }
}

fn tensor_view_to_tensor(view: &TensorView) -> Result<Tensor> {
    let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
    let data = view.data();

    match view.dtype() {
        Dtype::F32 => {
            let floats: Vec<f32> = data
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            Ok(Tensor::from_slice(&floats).reshape(&shape))
        }
        Dtype::F64 => {
            let doubles: Vec<f64> = data
                .chunks_exact(8)
                .map(|chunk| {
                    f64::from_le_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                        chunk[4], chunk[5], chunk[6], chunk[7],
                    ])
                })
                .collect();
            Ok(Tensor::from_slice(&doubles).to_kind(Kind::Float).reshape(&shape))
        }
        dtype => Err(Connect4NetError::ModelFormat(format!(
            "unsupported dtype: {dtype:?}"
        ))),
    }
}
