//! Next-token selection from a probability distribution.

use candle_core::Tensor;
use rand::Rng;

use crate::error::{Error, Result};

/// Decoding strategy used by the token stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampling {
    /// Always pick the most probable token.
    Greedy,
    /// Top-p sampling restricted to the smallest high-probability prefix
    /// whose mass reaches `top_p`.
    Nucleus { top_p: f32 },
}

impl Sampling {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Sampling::Greedy => Ok(()),
            Sampling::Nucleus { top_p } => check_threshold(top_p),
        }
    }

    pub fn sample(&self, probs: &[f32], rng: &mut impl Rng) -> Result<u32> {
        match *self {
            Sampling::Greedy => greedy_sample(probs),
            Sampling::Nucleus { top_p } => nucleus_sample(probs, top_p, rng),
        }
    }
}

fn check_threshold(threshold: f32) -> Result<()> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(Error::InvalidThreshold(threshold))
    }
}

fn check_distribution(probs: &[f32]) -> Result<()> {
    if probs.is_empty() {
        return Err(Error::MalformedDistribution("empty distribution".into()));
    }
    if let Some((idx, p)) = probs
        .iter()
        .enumerate()
        .find(|(_, p)| !p.is_finite() || **p < 0.0)
    {
        return Err(Error::MalformedDistribution(format!(
            "entry {idx} has probability {p}"
        )));
    }
    Ok(())
}

/// Nucleus (top-p) sampling.
///
/// Entries are sorted by descending probability; an entry is dropped when
/// the mass of the entries ranked before it already reaches `threshold`.
/// The top entry is therefore always kept, and `threshold = 1.0` keeps the
/// whole distribution. The kept entries are sampled proportionally to their
/// probabilities without explicit renormalization.
pub fn nucleus_sample(probs: &[f32], threshold: f32, rng: &mut impl Rng) -> Result<u32> {
    check_threshold(threshold)?;
    check_distribution(probs)?;

    let mut sorted: Vec<(u32, f32)> = probs
        .iter()
        .enumerate()
        .map(|(i, &p)| (i as u32, p))
        .collect();
    sorted.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));

    // At 1.0 nothing is cut, even when rounding pushes the running mass
    // past one before the tail.
    let truncate = threshold < 1.0;
    let mut preceding = 0.0f64;
    let mut kept = 0.0f64;
    let mut cutoff = sorted.len();
    for (rank, &(_, p)) in sorted.iter().enumerate() {
        if truncate && rank > 0 && preceding >= threshold as f64 {
            cutoff = rank;
            break;
        }
        preceding += p as f64;
        kept += p as f64;
    }
    let nucleus = &sorted[..cutoff];

    if kept <= 0.0 {
        return Err(Error::MalformedDistribution(
            "no probability mass left to sample from".into(),
        ));
    }

    let r = rng.random::<f64>() * kept;
    let mut cumulative = 0.0f64;
    for &(idx, p) in nucleus {
        cumulative += p as f64;
        if r < cumulative {
            return Ok(idx);
        }
    }
    // r landed on the rounding edge; fall back to the last entry with mass.
    Ok(nucleus
        .iter()
        .rev()
        .find(|(_, p)| *p > 0.0)
        .map(|(idx, _)| *idx)
        .unwrap_or(nucleus[0].0))
}

/// Arg-max sampling. Ties resolve to the lowest index.
pub fn greedy_sample(probs: &[f32]) -> Result<u32> {
    check_distribution(probs)?;
    let mut best = 0;
    for (i, &p) in probs.iter().enumerate().skip(1) {
        if p > probs[best] {
            best = i;
        }
    }
    Ok(best as u32)
}

/// Scales logits by `1 / temperature` and applies softmax over the last
/// dimension.
pub fn softmax_with_temperature(logits: &Tensor, temperature: f64) -> Result<Tensor> {
    if !(temperature.is_finite() && temperature > 0.0) {
        return Err(Error::InvalidTemperature(temperature));
    }
    let logits = if temperature != 1.0 {
        logits.affine(1.0 / temperature, 0.0)?
    } else {
        logits.clone()
    };
    Ok(candle_nn::ops::softmax_last_dim(&logits)?)
}
