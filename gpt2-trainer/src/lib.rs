pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod generate;
pub mod io;
pub mod model;
pub mod optim;
pub mod sample;
pub mod schedule;
pub mod tokenizer;
pub mod training;
pub mod worker;

pub use checkpoint::{Checkpoint, Progress};
pub use config::{ModelConfig, TrainingConfig};
pub use data::{Dataset, ShardedLoader};
pub use distributed::{Communicator, DistributedConfig, avg_between_processes};
pub use error::{Error, Result};
pub use generate::{DecodeState, print_stream, stream};
pub use model::{GPT, ParamKind};
pub use sample::Sampling;
pub use schedule::WarmupCosine;
pub use tokenizer::Tokenizer;
pub use training::{LossSeries, Reporter, Trainer, TrainingState};
pub use worker::{WorkerOptions, launch, run_worker};
