//! Training checkpoints as single safetensors files.
//!
//! Layout: model tensors under `model.<name>`, optimizer moments under
//! `optim.<name>.m` / `optim.<name>.v`, and string metadata holding the
//! model config (JSON) and progress counters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use safetensors::SafeTensors;
use tracing::info;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::optim::{AdamW, named_vars};

const MODEL_PREFIX: &str = "model.";
const OPTIM_PREFIX: &str = "optim.";

/// Position in the run at which a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub epoch: usize,
    /// Update index within the epoch
    pub update: usize,
    pub global_update: usize,
}

/// `<dir>/epoch_<e>_update_<u>.safetensors`
pub fn checkpoint_path(dir: &Path, epoch: usize, update: usize) -> PathBuf {
    dir.join(format!("epoch_{epoch}_update_{update}.safetensors"))
}

pub struct Checkpoint {
    pub model_config: ModelConfig,
    pub progress: Progress,
    pub optimizer_step: usize,
    pub model: HashMap<String, Tensor>,
    pub optimizer: HashMap<String, Tensor>,
}

impl Checkpoint {
    pub fn save(
        path: &Path,
        model_config: &ModelConfig,
        var_map: &VarMap,
        optimizer: &AdamW,
        progress: Progress,
    ) -> Result<()> {
        let mut tensors: Vec<(String, Tensor)> = named_vars(var_map)
            .into_iter()
            .map(|(name, var)| (format!("{MODEL_PREFIX}{name}"), var.as_tensor().clone()))
            .collect();
        tensors.extend(
            optimizer
                .state_tensors()
                .into_iter()
                .map(|(name, t)| (format!("{OPTIM_PREFIX}{name}"), t)),
        );

        let metadata: HashMap<String, String> = [
            ("model_config", serde_json::to_string(model_config)?),
            ("epoch", progress.epoch.to_string()),
            ("update", progress.update.to_string()),
            ("global_update", progress.global_update.to_string()),
            ("optimizer_step", optimizer.step_count().to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Rename into place so a crash never leaves a truncated checkpoint.
        let tmp = path.with_extension("safetensors.tmp");
        safetensors::serialize_to_file(tensors, Some(metadata), &tmp)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let buffer = std::fs::read(path)?;
        let (_, header) = SafeTensors::read_metadata(&buffer)?;
        let metadata = header
            .metadata()
            .clone()
            .ok_or_else(|| Error::Checkpoint(format!("{} has no metadata", path.display())))?;

        let field = |key: &str| {
            metadata
                .get(key)
                .ok_or_else(|| Error::Checkpoint(format!("metadata field {key} missing")))
        };
        let counter = |key: &str| -> Result<usize> {
            field(key)?
                .parse()
                .map_err(|e| Error::Checkpoint(format!("metadata field {key}: {e}")))
        };

        let model_config: ModelConfig = serde_json::from_str(field("model_config")?)?;
        let progress = Progress {
            epoch: counter("epoch")?,
            update: counter("update")?,
            global_update: counter("global_update")?,
        };
        let optimizer_step = counter("optimizer_step")?;

        let mut model = HashMap::new();
        let mut optimizer = HashMap::new();
        for (name, tensor) in candle_core::safetensors::load_buffer(&buffer, device)? {
            if let Some(rest) = name.strip_prefix(MODEL_PREFIX) {
                model.insert(rest.to_string(), tensor);
            } else if let Some(rest) = name.strip_prefix(OPTIM_PREFIX) {
                optimizer.insert(rest.to_string(), tensor);
            } else {
                return Err(Error::Checkpoint(format!("unexpected tensor {name}")));
            }
        }

        Ok(Self {
            model_config,
            progress,
            optimizer_step,
            model,
            optimizer,
        })
    }

    /// Copies parameters into `var_map` and, when given, moments into
    /// `optimizer`. Every variable must be present with a matching shape.
    pub fn restore(&self, var_map: &VarMap, optimizer: Option<&mut AdamW>) -> Result<()> {
        for (name, var) in named_vars(var_map) {
            let tensor = self
                .model
                .get(&name)
                .ok_or_else(|| Error::Checkpoint(format!("parameter {name} missing")))?;
            if tensor.shape() != var.shape() {
                return Err(Error::Checkpoint(format!(
                    "parameter {name} has shape {:?}, expected {:?}",
                    tensor.shape(),
                    var.shape()
                )));
            }
            var.set(&tensor.to_device(var.device())?.to_dtype(var.dtype())?)?;
        }
        if let Some(optimizer) = optimizer {
            optimizer.load_state(&self.optimizer, self.optimizer_step)?;
        }
        info!(
            "Restored checkpoint at epoch {}, global update {}",
            self.progress.epoch, self.progress.global_update
        );
        Ok(())
    }
}
