//! Per-process bootstrap: one worker per device.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{SystemTime, UNIX_EPOCH};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use tracing::{info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::{ModelConfig, TrainingConfig};
use crate::data::{Dataset, ShardedLoader};
use crate::distributed::{Communicator, DistributedConfig, connect, run_comm_file};
use crate::error::{Error, Result};
use crate::model::GPT;
use crate::tokenizer::Tokenizer;
use crate::training::{LossSeries, Reporter, RunDirs, Trainer};

/// Everything a worker needs besides its place in the process group.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub train_data: PathBuf,
    pub validation_data: PathBuf,
    /// Path to a tokenizer.json, or a hub identifier when no such file exists
    pub tokenizer: String,
    /// Architecture; the vocabulary size is taken from the tokenizer
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub run_id: String,
    pub use_gpu: bool,
    /// Checkpoint to continue from
    pub resume: Option<PathBuf>,
}

/// Number of workers to start: one per CUDA device, or one on CPU.
pub fn probe_world_size() -> usize {
    #[cfg(feature = "nccl")]
    {
        match cudarc::driver::CudaContext::device_count() {
            Ok(n) if n > 0 => return n as usize,
            Ok(_) => {}
            Err(e) => warn!("CUDA device probe failed: {:?}", e),
        }
    }
    1
}

/// Seconds since the Unix epoch, used to name a run.
pub fn default_run_id() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
        .to_string()
}

#[allow(unused_variables)]
pub fn select_device(use_gpu: bool, ordinal: usize) -> Result<Device> {
    if use_gpu {
        #[cfg(feature = "metal")]
        {
            return Ok(Device::new_metal(ordinal)?);
        }
        #[cfg(feature = "cuda")]
        {
            return Ok(Device::new_cuda(ordinal)?);
        }
        #[cfg(not(any(feature = "metal", feature = "cuda")))]
        {
            warn!("No GPU feature enabled, using CPU. Build with --features metal or --features cuda");
        }
    }
    Ok(Device::Cpu)
}

pub fn load_tokenizer(spec: &str) -> Result<Tokenizer> {
    if Path::new(spec).exists() {
        info!("Loading tokenizer from {}", spec);
        Tokenizer::from_file(spec)
    } else {
        info!("Fetching tokenizer {}", spec);
        Tokenizer::from_pretrained(spec)
    }
}

/// Starts `world_size` copies of the current executable, passing each
/// `args` followed by its rank and the shared run id, and waits for all of
/// them. Fails if any worker fails.
pub fn launch(world_size: usize, args: &[OsString], run_id: &str) -> Result<()> {
    let exe = std::env::current_exe()?;
    info!("Launching {} workers for run {}", world_size, run_id);

    let mut children: Vec<(usize, Child)> = Vec::with_capacity(world_size);
    for rank in 0..world_size {
        let spawned = Command::new(&exe)
            .args(args)
            .arg("--world-size")
            .arg(world_size.to_string())
            .arg("--rank")
            .arg(rank.to_string())
            .arg("--run-id")
            .arg(run_id)
            .spawn();
        match spawned {
            Ok(child) => children.push((rank, child)),
            Err(e) => {
                for (_, child) in &mut children {
                    let _ = child.kill();
                }
                return Err(Error::Worker {
                    rank,
                    reason: format!("failed to spawn: {e}"),
                });
            }
        }
    }

    let mut first_failure = None;
    for (rank, mut child) in children {
        let status = child.wait()?;
        if !status.success() {
            warn!("Worker {} exited with {}", rank, status);
            first_failure.get_or_insert(Error::Worker {
                rank,
                reason: format!("exited with {status}"),
            });
        }
    }
    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Runs one worker end to end: rendezvous, model and optimizer setup,
/// training, and teardown.
///
/// Teardown runs on every exit path once the group has formed: the worker
/// waits at a barrier for its peers before the communicator is released.
pub fn run_worker(options: &WorkerOptions, dist: &DistributedConfig) -> Result<LossSeries> {
    let device = select_device(options.use_gpu, dist.rank)?;
    info!(
        "Worker {}/{} starting on {:?}",
        dist.rank, dist.world_size, device
    );
    let dist = DistributedConfig {
        comm_file: run_comm_file(&dist.comm_file, &options.run_id),
        ..dist.clone()
    };
    let comm = connect(&dist, &device)?;

    let result = train_worker(options, comm.as_ref(), &device);
    if let Err(e) = &result {
        warn!("Worker {}/{} failed: {}", dist.rank, dist.world_size, e);
    }

    info!(
        "Worker {}/{} waiting to clean up after itself.",
        dist.rank, dist.world_size
    );
    let barrier = comm.barrier();
    info!(
        "Worker {}/{} cleaning up after itself.",
        dist.rank, dist.world_size
    );
    drop(comm);

    let series = result?;
    barrier?;
    Ok(series)
}

fn train_worker(
    options: &WorkerOptions,
    comm: &dyn Communicator,
    device: &Device,
) -> Result<LossSeries> {
    let tokenizer = load_tokenizer(&options.tokenizer)?;
    let model_config = ModelConfig {
        vocab_size: tokenizer.vocab_size(),
        ..options.model.clone()
    };
    // One extra position per row so X fills the whole context.
    let row_len = model_config.max_seq_len + 1;

    let training = &options.training;
    let train_loader = ShardedLoader::new(
        Dataset::from_jsonl(&options.train_data, &tokenizer, row_len)?,
        training.batch_size,
        comm.world_size(),
        comm.rank(),
        true,
        training.seed,
    );
    let eval_loader = ShardedLoader::new(
        Dataset::from_jsonl(&options.validation_data, &tokenizer, row_len)?,
        training.eval_batch_size,
        comm.world_size(),
        comm.rank(),
        false,
        training.seed,
    );

    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
    let model = GPT::new(&model_config, vb)?;

    let mut trainer = Trainer::new(
        model,
        var_map,
        training.clone(),
        comm,
        tokenizer.pad_token_id(),
        device.clone(),
    )?;
    if let Some(path) = &options.resume {
        let checkpoint = Checkpoint::load(path, device)?;
        if checkpoint.model_config != model_config {
            return Err(Error::Checkpoint(format!(
                "{} was trained with a different model configuration",
                path.display()
            )));
        }
        trainer.resume(&checkpoint)?;
    }
    if comm.is_main_process() {
        let dirs = RunDirs::new(Path::new(&training.output_dir), &options.run_id);
        let reporter = Reporter::new(&tokenizer, dirs, training)?;
        model_config.save_json(reporter.dirs().checkpoints.join("config.json"))?;
        training.save_json(reporter.dirs().checkpoints.join("training.json"))?;
        info!(
            "Training {} batches per epoch on each of {} workers",
            train_loader.num_batches(),
            comm.world_size()
        );
        trainer = trainer.with_reporter(reporter);
    }
    trainer.train(&train_loader, &eval_loader)
}
