use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::Device;
use candle_nn::VarMap;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::info;

use crate::checkpoint::{Checkpoint, Progress, checkpoint_path};
use crate::config::TrainingConfig;
use crate::data::{Batch, ShardedLoader};
use crate::distributed::{Communicator, avg_between_processes, broadcast_from_main};
use crate::error::{Error, Result};
use crate::generate::print_stream;
use crate::model::{GPT, masked_cross_entropy};
use crate::optim::{AdamW, AdamWConfig, GradAccumulator, ParamGroups, clip_grad_norm};
use crate::sample::Sampling;
use crate::schedule::WarmupCosine;
use crate::tokenizer::Tokenizer;

/// Train and eval loss keyed by global update index.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LossSeries {
    pub train: BTreeMap<usize, f32>,
    pub eval: BTreeMap<usize, f32>,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingState {
    /// 1-based epoch
    pub epoch: usize,
    /// 1-based batch index within the epoch
    pub batch: usize,
    pub global_update: usize,
    /// Mean micro-batch loss over the current log period
    pub running_loss: f32,
    pub unclipped_norms: Vec<f32>,
}

/// Output directories of one run.
#[derive(Debug, Clone)]
pub struct RunDirs {
    pub checkpoints: PathBuf,
    pub plots: PathBuf,
}

impl RunDirs {
    /// `<output>/model_checkpoints/<run_id>` and `<output>/plots/<run_id>`.
    pub fn new(output_dir: &Path, run_id: &str) -> Self {
        Self {
            checkpoints: output_dir.join("model_checkpoints").join(run_id),
            plots: output_dir.join("plots").join(run_id),
        }
    }

    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.checkpoints)?;
        std::fs::create_dir_all(&self.plots)?;
        Ok(())
    }
}

/// Capability to produce side effects: status lines, sample streams,
/// checkpoints and loss series. Exactly one worker holds it.
pub struct Reporter<'a> {
    tokenizer: &'a Tokenizer,
    dirs: RunDirs,
    stream_prompt: String,
    sampling: Sampling,
    temperature: f64,
    rng: StdRng,
    progress: ProgressBar,
    period_start: Instant,
}

impl<'a> Reporter<'a> {
    pub fn new(tokenizer: &'a Tokenizer, dirs: RunDirs, config: &TrainingConfig) -> Result<Self> {
        dirs.create()?;
        Ok(Self {
            tokenizer,
            dirs,
            stream_prompt: config.stream_prompt.clone(),
            sampling: Sampling::Nucleus {
                top_p: config.stream_top_p,
            },
            temperature: config.stream_temperature,
            rng: StdRng::seed_from_u64(config.seed),
            progress: ProgressBar::hidden(),
            period_start: Instant::now(),
        })
    }

    pub fn dirs(&self) -> &RunDirs {
        &self.dirs
    }

    fn start_epoch(&mut self, num_batches: usize, done: usize) {
        let pb = ProgressBar::new(num_batches as u64);
        pb.set_position(done as u64);
        pb.set_style(
            ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        self.progress = pb;
        self.period_start = Instant::now();
    }

    fn log_status(&mut self, line: String) {
        self.progress.suspend(|| info!("{}", line));
    }

    fn stream(&mut self, model: &GPT, max_length: usize) -> Result<()> {
        let progress = self.progress.clone();
        progress.suspend(|| {
            print_stream(
                model,
                self.tokenizer,
                &self.stream_prompt,
                max_length,
                self.sampling,
                self.temperature,
                &mut self.rng,
            )?;
            println!();
            Ok(())
        })
    }

    fn save_checkpoint(
        &self,
        model: &GPT,
        var_map: &VarMap,
        optimizer: &AdamW,
        progress: Progress,
    ) -> Result<()> {
        let path = checkpoint_path(&self.dirs.checkpoints, progress.epoch, progress.update);
        self.progress
            .suspend(|| info!("Saving checkpoint to '{}'.", path.display()));
        Checkpoint::save(&path, model.config(), var_map, optimizer, progress)
    }

    /// Writes the loss series and gradient-norm trace for `epoch`.
    fn write_series(&self, epoch: usize, series: &LossSeries, norms: &[f32]) -> Result<()> {
        let losses = self.dirs.plots.join(format!("losses__epoch_{epoch}.json"));
        std::fs::write(&losses, serde_json::to_string_pretty(series)?)?;
        let norms_path = self
            .dirs
            .plots
            .join(format!("unclipped_update_norm__epoch_{epoch}.json"));
        std::fs::write(&norms_path, serde_json::to_string(norms)?)?;
        Ok(())
    }
}

/// Data-parallel training loop for one worker.
///
/// Every worker runs the same sequence of collectives: gradient
/// synchronization at each update, loss averaging at each log period, and
/// the full validation pass at each eval period. Streaming and checkpointing
/// happen only where a [`Reporter`] is present and never communicate.
pub struct Trainer<'a> {
    model: GPT,
    var_map: VarMap,
    optimizer: AdamW,
    schedule: WarmupCosine,
    accumulator: GradAccumulator,
    config: TrainingConfig,
    comm: &'a dyn Communicator,
    reporter: Option<Reporter<'a>>,
    pad_id: u32,
    device: Device,
    state: TrainingState,
    resume_from: Option<Progress>,
}

impl<'a> Trainer<'a> {
    /// Takes ownership of a freshly built model, replaces its parameters
    /// with rank 0's so every worker starts identical, and sets up the
    /// optimizer groups.
    pub fn new(
        model: GPT,
        var_map: VarMap,
        config: TrainingConfig,
        comm: &'a dyn Communicator,
        pad_id: u32,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let groups = ParamGroups::from_model(&model, &var_map, config.weight_decay)?;
        let vars = groups.vars();

        let initial: Vec<_> = vars.iter().map(|v| v.as_tensor().clone()).collect();
        for (var, value) in vars.iter().zip(broadcast_from_main(comm, &initial)?) {
            var.set(&value)?;
        }

        let optimizer = AdamW::new(&groups, AdamWConfig::from_training(&config))?;
        if comm.is_main_process() {
            info!(
                "Initialized model with {} parameters",
                model.num_parameters()
            );
        }
        Ok(Self {
            model,
            var_map,
            optimizer,
            schedule: WarmupCosine::new(config.learning_rate, config.warmup_steps, 0),
            accumulator: GradAccumulator::new(vars),
            config,
            comm,
            reporter: None,
            pad_id,
            device,
            state: TrainingState::default(),
            resume_from: None,
        })
    }

    /// Makes this worker the reporting worker.
    pub fn with_reporter(mut self, reporter: Reporter<'a>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Continues from `checkpoint`: parameters, optimizer moments, and the
    /// position in the run. [`Trainer::train`] then fast-forwards the
    /// schedule and skips the batches already seen. Every worker must resume
    /// from the same checkpoint.
    pub fn resume(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoint.restore(&self.var_map, Some(&mut self.optimizer))?;
        self.state.global_update = checkpoint.progress.global_update;
        self.resume_from = Some(checkpoint.progress);
        Ok(())
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Runs all epochs and returns the recorded loss series. Only the
    /// reporting worker records anything.
    pub fn train(
        &mut self,
        train_loader: &ShardedLoader,
        eval_loader: &ShardedLoader,
    ) -> Result<LossSeries> {
        let row_len = train_loader.dataset().row_len();
        if row_len - 1 > self.model.config().max_seq_len {
            return Err(Error::Config(format!(
                "rows of {} tokens exceed the model context of {}",
                row_len,
                self.model.config().max_seq_len
            )));
        }

        let accum = self.config.gradient_accumulation_steps;
        let num_batches = train_loader.num_batches();
        let num_updates = num_batches / accum;
        self.schedule = WarmupCosine::new(
            self.config.learning_rate,
            self.config.warmup_steps,
            self.config.epochs * num_updates,
        );
        let start = self.resume_from.take();
        if let Some(progress) = start {
            self.schedule.set_step(progress.global_update);
            if self.comm.is_main_process() {
                info!(
                    "Resuming at epoch {}, update {} ({} updates done)",
                    progress.epoch, progress.update, progress.global_update
                );
            }
        }
        self.optimizer.set_learning_rate(self.schedule.current_lr());

        let mut series = LossSeries::default();
        let first_epoch = start.map_or(1, |p| p.epoch);
        for epoch in first_epoch..=self.config.epochs {
            self.state.epoch = epoch;
            let skip = match start {
                Some(p) if p.epoch == epoch => (p.update * accum).min(num_batches),
                _ => 0,
            };
            if let Some(reporter) = self.reporter.as_mut() {
                reporter.start_epoch(num_batches, skip);
            }

            for (i, batch) in train_loader
                .batches(epoch, &self.device)
                .enumerate()
                .skip(skip)
            {
                self.state.batch = i + 1;
                self.train_batch(&batch?, num_updates, eval_loader, &mut series)?;
            }

            if let Some(reporter) = self.reporter.as_ref() {
                reporter.progress.finish_and_clear();
                info!(
                    "{}COMPLETED EPOCH {}/{}{}",
                    "=".repeat(40),
                    epoch,
                    self.config.epochs,
                    "=".repeat(40)
                );
                reporter.write_series(epoch, &series, &self.state.unclipped_norms)?;
            }
        }
        Ok(series)
    }

    fn train_batch(
        &mut self,
        batch: &Batch,
        num_updates: usize,
        eval_loader: &ShardedLoader,
        series: &mut LossSeries,
    ) -> Result<()> {
        let accum = self.config.gradient_accumulation_steps;
        let batch_i = self.state.batch;
        let update_i = batch_i / accum;
        let should_update = batch_i % accum == 0;

        let (x, y) = batch.split()?;
        let logits = self.model.forward(&x, true)?;
        let loss = (masked_cross_entropy(&logits, &y, self.pad_id)? / accum as f64)?;
        self.state.running_loss += loss.to_scalar::<f32>()? / self.config.log_period as f32;
        self.accumulator.accumulate(&loss.backward()?)?;

        if should_update {
            self.state.global_update += 1;
            self.accumulator.synchronize(self.comm)?;
            let mut grads = self.accumulator.take();
            let norm = clip_grad_norm(&mut grads, self.config.grad_clip)?;
            self.state.unclipped_norms.push(norm);
            self.optimizer.step(&grads)?;
            self.optimizer.set_learning_rate(self.schedule.step());
        }

        if batch_i % (self.config.log_period * accum) == 0 {
            let mut avg_loss = self.state.running_loss;
            avg_between_processes(self.comm, &mut avg_loss)?;
            if let Some(reporter) = self.reporter.as_mut() {
                series.train.insert(self.state.global_update, avg_loss);
                let seconds = reporter.period_start.elapsed().as_secs_f64();
                let ms_per_update = 1000.0 * seconds / self.config.log_period as f64;
                let tokens_per_update = x.elem_count() * accum * self.comm.world_size();
                reporter.log_status(format!(
                    "Update {}/{} in epoch {}/{}: Loss={:.3}, Grad norm={:.2}, ms/update={:.0}, tokens/ms={:.0}",
                    update_i,
                    num_updates,
                    self.state.epoch,
                    self.config.epochs,
                    avg_loss,
                    self.state.unclipped_norms.last().copied().unwrap_or(f32::NAN),
                    ms_per_update,
                    tokens_per_update as f64 / ms_per_update.max(f64::EPSILON)
                ));
                reporter.period_start = Instant::now();
            }
            self.state.running_loss = 0.0;
        }

        if batch_i % (self.config.stream_period * accum) == 0 {
            if let Some(reporter) = self.reporter.as_mut() {
                reporter.stream(&self.model, x.dim(1)?)?;
            }
        }

        if batch_i % (self.config.eval_period * accum) == 0 {
            let val_loss = self.evaluate(eval_loader)?;
            if let Some(reporter) = self.reporter.as_mut() {
                series.eval.insert(self.state.global_update, val_loss);
                reporter.log_status(format!("Average validation loss: {val_loss}"));
            }
        }

        if batch_i % (self.config.checkpoint_period * accum) == 0 {
            if let Some(reporter) = self.reporter.as_ref() {
                let progress = Progress {
                    epoch: self.state.epoch,
                    update: update_i,
                    global_update: self.state.global_update,
                };
                reporter.save_checkpoint(&self.model, &self.var_map, &self.optimizer, progress)?;
            }
        }

        if let Some(reporter) = self.reporter.as_ref() {
            reporter.progress.inc(1);
        }
        Ok(())
    }

    /// Mean validation loss, each batch weighted equally, averaged across
    /// workers. Collective: every worker must call it.
    pub fn evaluate(&self, loader: &ShardedLoader) -> Result<f32> {
        let num_batches = loader.num_batches();
        let mut avg_loss = 0f32;
        for batch in loader.batches(self.state.epoch, &self.device) {
            let (x, y) = batch?.split()?;
            let logits = self.model.forward(&x, false)?;
            let loss = masked_cross_entropy(&logits, &y, self.pad_id)?.to_scalar::<f32>()?;
            avg_loss += loss / num_batches as f32;
        }
        avg_between_processes(self.comm, &mut avg_loss)?;
        Ok(avg_loss)
    }
}
