use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// GPT-2 architecture hyperparameters. Persisted into every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Maximum sequence length (context window)
    pub max_seq_len: usize,
    /// Embedding dimension
    pub hidden_size: usize,
    /// Number of transformer layers
    pub num_layers: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Intermediate size in FFN (typically 4x hidden_size)
    pub intermediate_size: usize,
    /// Dropout probability
    pub dropout: f64,
    /// Layer norm epsilon
    pub layer_norm_eps: f64,
}

impl ModelConfig {
    /// GPT-2 Small configuration (124M parameters)
    pub fn gpt2_small() -> Self {
        Self {
            vocab_size: 50258,
            max_seq_len: 512,
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            intermediate_size: 3072,
            dropout: 0.1,
            layer_norm_eps: 1e-5,
        }
    }

    /// GPT-2 Medium configuration (355M parameters)
    pub fn gpt2_medium() -> Self {
        Self {
            hidden_size: 1024,
            num_layers: 24,
            num_heads: 16,
            intermediate_size: 4096,
            ..Self::gpt2_small()
        }
    }

    /// GPT-2 Large configuration (774M parameters)
    pub fn gpt2_large() -> Self {
        Self {
            hidden_size: 1280,
            num_layers: 36,
            num_heads: 20,
            intermediate_size: 5120,
            ..Self::gpt2_small()
        }
    }

    /// Nano configuration - fastest for testing
    pub fn nano() -> Self {
        Self {
            vocab_size: 1000,
            max_seq_len: 128,
            hidden_size: 64,
            num_layers: 2,
            num_heads: 2,
            intermediate_size: 256,
            dropout: 0.1,
            layer_norm_eps: 1e-5,
        }
    }

    /// Tiny configuration for debugging runs
    pub fn tiny() -> Self {
        Self {
            vocab_size: 1000,
            max_seq_len: 256,
            hidden_size: 128,
            num_layers: 4,
            num_heads: 4,
            intermediate_size: 512,
            dropout: 0.1,
            layer_norm_eps: 1e-5,
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "nano" => Some(Self::nano()),
            "tiny" => Some(Self::tiny()),
            "gpt2-small" => Some(Self::gpt2_small()),
            "gpt2-medium" => Some(Self::gpt2_medium()),
            "gpt2-large" => Some(Self::gpt2_large()),
            _ => None,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Rough parameter count, biases and norms included.
    pub fn num_parameters(&self) -> usize {
        let h = self.hidden_size;
        let embed = self.vocab_size * h + self.max_seq_len * h;
        let attn = 4 * (h * h + h);
        let ffn = 2 * h * self.intermediate_size + self.intermediate_size + h;
        let norms = 4 * h;
        let head = h * self.vocab_size;
        embed + self.num_layers * (attn + ffn + norms) + 2 * h + head
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(Error::Config(format!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.vocab_size == 0 || self.max_seq_len == 0 {
            return Err(Error::Config(
                "vocab_size and max_seq_len must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Peak learning rate reached at the end of warmup
    pub learning_rate: f64,
    /// Weight decay applied to regularizable parameters
    pub weight_decay: f64,
    /// Adam beta1
    pub beta1: f64,
    /// Adam beta2
    pub beta2: f64,
    /// Adam epsilon
    pub eps: f64,
    /// Gradient clipping max norm
    pub grad_clip: f64,
    /// Training batch size per worker
    pub batch_size: usize,
    /// Validation batch size per worker
    pub eval_batch_size: usize,
    /// Number of training epochs
    pub epochs: usize,
    /// Warmup updates for the learning rate schedule
    pub warmup_steps: usize,
    /// Micro-batches per optimizer update
    pub gradient_accumulation_steps: usize,
    /// Log every N updates
    pub log_period: usize,
    /// Stream a sample every N updates
    pub stream_period: usize,
    /// Evaluate every N updates
    pub eval_period: usize,
    /// Save checkpoint every N updates
    pub checkpoint_period: usize,
    /// Prompt used for the diagnostic sample stream
    pub stream_prompt: String,
    /// Nucleus threshold for the diagnostic sample stream
    pub stream_top_p: f32,
    /// Temperature for the diagnostic sample stream
    pub stream_temperature: f64,
    /// Seed for the per-epoch data shuffle
    pub seed: u64,
    /// Root directory for checkpoints and loss series
    pub output_dir: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2.5e-4,
            weight_decay: 0.01,
            beta1: 0.9,
            beta2: 0.98,
            eps: 1e-9,
            grad_clip: 1.0,
            batch_size: 64,
            eval_batch_size: 128,
            epochs: 100,
            warmup_steps: 2000,
            gradient_accumulation_steps: 1,
            log_period: 25,
            stream_period: 100,
            eval_period: 250,
            checkpoint_period: 50,
            stream_prompt: "<|endoftext|>She first".to_string(),
            stream_top_p: 0.95,
            stream_temperature: 1.0,
            seed: 0,
            output_dir: "outputs".to_string(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("eval_batch_size", self.eval_batch_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("warmup_steps", self.warmup_steps),
            ("log_period", self.log_period),
            ("stream_period", self.stream_period),
            ("eval_period", self.eval_period),
            ("checkpoint_period", self.checkpoint_period),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if !(0.0..=1.0).contains(&self.stream_top_p) {
            return Err(Error::InvalidThreshold(self.stream_top_p));
        }
        if !(self.stream_temperature.is_finite() && self.stream_temperature > 0.0) {
            return Err(Error::InvalidTemperature(self.stream_temperature));
        }
        if self.stream_prompt.is_empty() {
            return Err(Error::Config("stream_prompt must not be empty".to_string()));
        }
        if self.grad_clip <= 0.0 {
            return Err(Error::Config("grad_clip must be positive".to_string()));
        }
        Ok(())
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
