use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gpt2_trainer::checkpoint::Checkpoint;
use gpt2_trainer::config::{ModelConfig, TrainingConfig};
use gpt2_trainer::distributed::DistributedConfig;
use gpt2_trainer::generate::print_stream;
use gpt2_trainer::model::GPT;
use gpt2_trainer::sample::Sampling;
use gpt2_trainer::worker::{
    WorkerOptions, default_run_id, launch, load_tokenizer, probe_world_size, run_worker,
    select_device,
};

#[derive(Parser)]
#[command(name = "gpt2-trainer")]
#[command(about = "Data-parallel GPT-2 pretraining")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model, one worker per device
    #[command(args_override_self = true)]
    Train {
        /// Training split (JSONL with a "text" field, optionally .gz/.zst)
        #[arg(long)]
        train_data: PathBuf,

        /// Validation split (same format)
        #[arg(long)]
        validation_data: PathBuf,

        /// Tokenizer file, or a hub identifier to download
        #[arg(short, long, default_value = "openai-community/gpt2")]
        tokenizer: String,

        /// Model configuration preset (nano, tiny, gpt2-small, gpt2-medium, gpt2-large)
        #[arg(short, long, default_value = "gpt2-small")]
        model: String,

        /// Model configuration JSON, overrides --model
        #[arg(long)]
        model_config: Option<PathBuf>,

        /// Training configuration JSON; flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output root for checkpoints and loss series
        #[arg(short, long)]
        output: Option<String>,

        /// Peak learning rate
        #[arg(long)]
        lr: Option<f64>,

        /// Batch size per worker
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Gradient accumulation steps
        #[arg(long)]
        grad_accum: Option<usize>,

        /// Seed for the data shuffle and sample streams
        #[arg(long)]
        seed: Option<u64>,

        /// Continue from a checkpoint written by an earlier run
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "true")]
        gpu: bool,

        /// Number of workers (defaults to one per CUDA device)
        #[arg(long)]
        world_size: Option<usize>,

        /// Rank of this worker; set when running as a launched worker
        #[arg(long)]
        rank: Option<usize>,

        /// Run identifier shared by all workers (defaults to a timestamp)
        #[arg(long)]
        run_id: Option<String>,

        /// Rendezvous address
        #[arg(long, default_value = "127.0.0.1")]
        master_addr: String,

        /// Rendezvous port
        #[arg(long, default_value = "29500")]
        master_port: u16,

        /// Seconds to wait for all workers to join
        #[arg(long, default_value = "30")]
        rendezvous_timeout: u64,

        /// Seconds any single collective may block
        #[arg(long, default_value = "1800")]
        collective_timeout: u64,

        /// Communication file for NCCL ID exchange, suffixed with the run id
        #[arg(long, default_value = "nccl_id.txt")]
        comm_file: String,
    },

    /// Stream text from a checkpoint
    Generate {
        /// Path to a training checkpoint
        #[arg(short, long)]
        checkpoint: PathBuf,

        /// Tokenizer file, or a hub identifier to download
        #[arg(short, long, default_value = "openai-community/gpt2")]
        tokenizer: String,

        /// Prompt text
        #[arg(short, long)]
        prompt: String,

        /// Total length in tokens, prompt included
        #[arg(short, long, default_value = "128")]
        max_length: usize,

        /// Nucleus sampling threshold
        #[arg(long, default_value = "0.95")]
        top_p: f32,

        /// Pick the most probable token instead of sampling
        #[arg(long)]
        greedy: bool,

        /// Sampling temperature
        #[arg(long, default_value = "1.0")]
        temperature: f64,

        /// Sampling seed
        #[arg(long)]
        seed: Option<u64>,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "true")]
        gpu: bool,
    },

    /// Show model info
    Info {
        /// Model configuration preset
        #[arg(short, long, default_value = "gpt2-small")]
        model: String,
    },
}

fn get_config(name: &str) -> Result<ModelConfig> {
    match ModelConfig::preset(name) {
        Some(config) => Ok(config),
        None => anyhow::bail!("Unknown model config '{}'", name),
    }
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            train_data,
            validation_data,
            tokenizer,
            model,
            model_config,
            config,
            output,
            lr,
            batch_size,
            epochs,
            grad_accum,
            seed,
            resume,
            gpu,
            world_size,
            rank,
            run_id,
            master_addr,
            master_port,
            rendezvous_timeout,
            collective_timeout,
            comm_file,
        } => {
            let model = match model_config {
                Some(path) => ModelConfig::from_json(path)?,
                None => get_config(&model)?,
            };

            let mut training = match config {
                Some(path) => TrainingConfig::from_json(path)?,
                None => TrainingConfig::default(),
            };
            if let Some(lr) = lr {
                training.learning_rate = lr;
            }
            if let Some(batch_size) = batch_size {
                training.batch_size = batch_size;
                training.eval_batch_size = 2 * batch_size;
            }
            if let Some(epochs) = epochs {
                training.epochs = epochs;
            }
            if let Some(grad_accum) = grad_accum {
                training.gradient_accumulation_steps = grad_accum;
            }
            if let Some(output) = output {
                training.output_dir = output;
            }
            if let Some(seed) = seed {
                training.seed = seed;
            }
            training.validate()?;

            let world_size = world_size.unwrap_or_else(probe_world_size);
            let run_id = run_id.unwrap_or_else(default_run_id);

            let rank = match rank {
                Some(rank) => rank,
                None if world_size > 1 => {
                    info!("Running on {} devices", world_size);
                    let args: Vec<_> = std::env::args_os().skip(1).collect();
                    launch(world_size, &args, &run_id)?;
                    return Ok(());
                }
                None => {
                    info!("Running as a single worker");
                    0
                }
            };

            let dist = DistributedConfig {
                world_size,
                rank,
                master_addr,
                master_port,
                rendezvous_timeout: Duration::from_secs(rendezvous_timeout),
                collective_timeout: Duration::from_secs(collective_timeout),
                comm_file,
            };
            let options = WorkerOptions {
                train_data,
                validation_data,
                tokenizer,
                model,
                training,
                run_id,
                use_gpu: gpu,
                resume,
            };
            let series = run_worker(&options, &dist)?;
            if dist.is_main_process() {
                info!(
                    "Training complete: {} train and {} eval loss points",
                    series.train.len(),
                    series.eval.len()
                );
            }
        }

        Commands::Generate {
            checkpoint,
            tokenizer,
            prompt,
            max_length,
            top_p,
            greedy,
            temperature,
            seed,
            gpu,
        } => {
            let device = select_device(gpu, 0)?;
            info!("Using device: {:?}", device);

            let tokenizer = load_tokenizer(&tokenizer)?;
            let ckpt = Checkpoint::load(&checkpoint, &device)?;

            let var_map = VarMap::new();
            let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
            let model = GPT::new(&ckpt.model_config, vb)?;
            ckpt.restore(&var_map, None)?;
            info!("Loaded model from {}", checkpoint.display());

            let sampling = if greedy {
                Sampling::Greedy
            } else {
                Sampling::Nucleus { top_p }
            };
            let rng = StdRng::seed_from_u64(seed.unwrap_or_else(rand::random));
            let max_length = max_length.min(ckpt.model_config.max_seq_len);
            print_stream(
                &model,
                &tokenizer,
                &prompt,
                max_length,
                sampling,
                temperature,
                rng,
            )?;
        }

        Commands::Info { model } => {
            let config = get_config(&model)?;
            println!("Model: {}", model);
            println!("  Vocab size: {}", config.vocab_size);
            println!("  Max sequence length: {}", config.max_seq_len);
            println!("  Hidden size: {}", config.hidden_size);
            println!("  Num layers: {}", config.num_layers);
            println!("  Num heads: {}", config.num_heads);
            println!("  Intermediate size: {}", config.intermediate_size);
            println!("  Head dimension: {}", config.head_dim());

            let total = config.num_parameters();
            println!(
                "  Estimated parameters: {} ({:.2}M)",
                total,
                total as f64 / 1_000_000.0
            );
        }
    }

    Ok(())
}
