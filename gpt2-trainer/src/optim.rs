//! AdamW with per-group weight decay, gradient clipping and accumulation.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, TensorId, Var};
use candle_nn::VarMap;

use crate::config::TrainingConfig;
use crate::distributed::{Communicator, sync_gradients};
use crate::error::{Error, Result};
use crate::model::GPT;

/// Every variable of `var_map` with its name, sorted by name so that all
/// workers enumerate parameters in the same order.
pub fn named_vars(var_map: &VarMap) -> Vec<(String, Var)> {
    let data = var_map.data().lock().unwrap_or_else(|e| e.into_inner());
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub weight_decay: f64,
    pub params: Vec<(String, Var)>,
}

/// Optimizer parameter groups split by regularization role.
#[derive(Debug, Clone)]
pub struct ParamGroups {
    groups: Vec<ParamGroup>,
}

impl ParamGroups {
    /// Regularizable parameters get `weight_decay`; biases and normalization
    /// parameters get none. Fails if a variable carries no role tag.
    pub fn from_model(model: &GPT, var_map: &VarMap, weight_decay: f64) -> Result<Self> {
        let kinds: HashMap<TensorId, _> = model
            .tagged_params()
            .into_iter()
            .map(|p| (p.tensor.id(), p.kind))
            .collect();

        let mut decay = ParamGroup {
            weight_decay,
            params: Vec::new(),
        };
        let mut no_decay = ParamGroup {
            weight_decay: 0.0,
            params: Vec::new(),
        };
        for (name, var) in named_vars(var_map) {
            let kind = kinds.get(&var.as_tensor().id()).ok_or_else(|| {
                Error::Config(format!("parameter {name} has no role tag"))
            })?;
            if kind.regularizable() {
                decay.params.push((name, var));
            } else {
                no_decay.params.push((name, var));
            }
        }
        Ok(Self {
            groups: vec![decay, no_decay],
        })
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// All variables across groups, sorted by name.
    pub fn vars(&self) -> Vec<Var> {
        let mut all: Vec<&(String, Var)> =
            self.groups.iter().flat_map(|g| g.params.iter()).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all.into_iter().map(|(_, v)| v.clone()).collect()
    }
}

/// Gradients keyed by the variable they belong to.
#[derive(Debug, Default, Clone)]
pub struct Gradients {
    grads: HashMap<TensorId, Tensor>,
}

impl Gradients {
    pub fn get(&self, var: &Var) -> Option<&Tensor> {
        self.grads.get(&var.as_tensor().id())
    }

    pub fn insert(&mut self, var: &Var, grad: Tensor) {
        self.grads.insert(var.as_tensor().id(), grad);
    }

    /// Global L2 norm over every gradient.
    pub fn global_norm(&self) -> Result<f32> {
        let mut sum_sq = 0f64;
        for grad in self.grads.values() {
            sum_sq += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
        Ok(sum_sq.sqrt() as f32)
    }

    pub fn scale(&mut self, factor: f64) -> Result<()> {
        for grad in self.grads.values_mut() {
            *grad = grad.affine(factor, 0.0)?;
        }
        Ok(())
    }
}

/// Clips the global gradient norm to `max_norm` and returns the norm before
/// clipping.
pub fn clip_grad_norm(grads: &mut Gradients, max_norm: f64) -> Result<f32> {
    let norm = grads.global_norm()?;
    let clip_coef = max_norm / (norm as f64 + 1e-6);
    if clip_coef < 1.0 {
        grads.scale(clip_coef)?;
    }
    Ok(norm)
}

/// Sums gradients over the micro-batches of one update.
///
/// Cross-worker synchronization happens once per update, in
/// [`GradAccumulator::synchronize`], never per micro-batch.
pub struct GradAccumulator {
    vars: Vec<Var>,
    grads: Gradients,
}

impl GradAccumulator {
    pub fn new(vars: Vec<Var>) -> Self {
        Self {
            vars,
            grads: Gradients::default(),
        }
    }

    pub fn accumulate(&mut self, store: &GradStore) -> Result<()> {
        for var in &self.vars {
            let Some(grad) = store.get(var.as_tensor()) else {
                continue;
            };
            let summed = match self.grads.get(var) {
                Some(acc) => (acc + grad)?,
                None => grad.clone(),
            };
            self.grads.insert(var, summed);
        }
        Ok(())
    }

    /// Averages the accumulated gradients across workers with one collective.
    /// Variables without a gradient contribute zeros so every worker sends
    /// the same layout.
    pub fn synchronize(&mut self, comm: &dyn Communicator) -> Result<()> {
        if comm.world_size() == 1 {
            return Ok(());
        }
        let local = self
            .vars
            .iter()
            .map(|var| match self.grads.get(var) {
                Some(grad) => Ok(grad.clone()),
                None => Ok(var.as_tensor().zeros_like()?),
            })
            .collect::<Result<Vec<_>>>()?;
        let synced = sync_gradients(comm, &local)?;
        for (var, grad) in self.vars.iter().zip(synced) {
            self.grads.insert(var, grad);
        }
        Ok(())
    }

    /// Hands out the accumulated gradients and starts a new update.
    pub fn take(&mut self) -> Gradients {
        std::mem::take(&mut self.grads)
    }
}

#[derive(Debug, Clone)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl AdamWConfig {
    pub fn from_training(config: &TrainingConfig) -> Self {
        Self {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
        }
    }
}

struct ParamState {
    name: String,
    var: Var,
    weight_decay: f64,
    m: Tensor,
    v: Tensor,
}

/// AdamW with decoupled weight decay, one decay rate per parameter group.
pub struct AdamW {
    params: Vec<ParamState>,
    config: AdamWConfig,
    step_t: usize,
}

impl AdamW {
    pub fn new(groups: &ParamGroups, config: AdamWConfig) -> Result<Self> {
        let mut params = Vec::new();
        for group in groups.groups() {
            for (name, var) in &group.params {
                params.push(ParamState {
                    name: name.clone(),
                    var: var.clone(),
                    weight_decay: group.weight_decay,
                    m: var.as_tensor().zeros_like()?,
                    v: var.as_tensor().zeros_like()?,
                });
            }
        }
        params.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self {
            params,
            config,
            step_t: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> usize {
        self.step_t
    }

    pub fn step(&mut self, grads: &Gradients) -> Result<()> {
        self.step_t += 1;
        let AdamWConfig {
            lr,
            beta1,
            beta2,
            eps,
        } = self.config;
        let scale_m = 1.0 / (1.0 - beta1.powi(self.step_t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(self.step_t as i32));

        for p in &mut self.params {
            let Some(g) = grads.get(&p.var) else {
                continue;
            };
            let next_m = ((&p.m * beta1)? + (g * (1.0 - beta1))?)?;
            let next_v = ((&p.v * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let decayed = (p.var.as_tensor() * (1.0 - lr * p.weight_decay))?;
            let adjusted = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next = (decayed - (adjusted * lr)?)?;
            p.var.set(&next)?;
            p.m = next_m;
            p.v = next_v;
        }
        Ok(())
    }

    /// First and second moments as `<name>.m` / `<name>.v`.
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        self.params
            .iter()
            .flat_map(|p| {
                [
                    (format!("{}.m", p.name), p.m.clone()),
                    (format!("{}.v", p.name), p.v.clone()),
                ]
            })
            .collect()
    }

    /// Restores moments written by [`AdamW::state_tensors`].
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>, step: usize) -> Result<()> {
        for p in &mut self.params {
            for (suffix, slot) in [("m", &mut p.m), ("v", &mut p.v)] {
                let key = format!("{}.{}", p.name, suffix);
                let t = tensors.get(&key).ok_or_else(|| {
                    Error::Checkpoint(format!("optimizer state {key} missing"))
                })?;
                if t.shape() != slot.shape() {
                    return Err(Error::Checkpoint(format!(
                        "optimizer state {key} has shape {:?}, expected {:?}",
                        t.shape(),
                        slot.shape()
                    )));
                }
                *slot = t.to_device(slot.device())?.to_dtype(slot.dtype())?;
            }
        }
        self.step_t = step;
        Ok(())
    }
}
