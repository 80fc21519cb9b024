//! Error types for gpt2-trainer

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Invalid nucleus threshold {0}: must be within [0, 1]")]
    InvalidThreshold(f32),

    #[error("Invalid temperature {0}: must be finite and > 0")]
    InvalidTemperature(f64),

    #[error("Malformed probability distribution: {0}")]
    MalformedDistribution(String),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("Rendezvous failed for rank {rank}: {reason}")]
    Rendezvous { rank: usize, reason: String },

    #[error("Collective {op} timed out on rank {rank}")]
    CollectiveTimeout { rank: usize, op: &'static str },

    #[error("Collective {op} failed on rank {rank}: {reason}")]
    Collective {
        rank: usize,
        op: &'static str,
        reason: String,
    },

    #[error("Worker {rank} failed: {reason}")]
    Worker { rank: usize, reason: String },

    #[error("Backend unavailable: {0}")]
    Backend(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
