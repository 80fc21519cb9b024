//! Autoregressive token streaming for qualitative checks during training.

use std::io::Write;

use candle_core::Tensor;
use rand::Rng;

use crate::error::{Error, Result};
use crate::sample::{Sampling, softmax_with_temperature};
use crate::tokenizer::Tokenizer;

/// Incremental decoding cache, owned by whoever drives generation.
///
/// Holds the attention keys/values of every layer for the positions
/// decoded so far. One state per independent generation; call
/// [`DecodeState::reset`] before reusing it.
#[derive(Debug, Clone, Default)]
pub struct DecodeState {
    layers: Vec<Option<(Tensor, Tensor)>>,
    seq_len: usize,
}

impl DecodeState {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![None; num_layers],
            seq_len: 0,
        }
    }

    /// Number of positions already held in the cache.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn reset(&mut self) {
        self.layers.iter_mut().for_each(|l| *l = None);
        self.seq_len = 0;
    }

    pub(crate) fn layer_mut(&mut self, layer: usize) -> Result<&mut Option<(Tensor, Tensor)>> {
        let num_layers = self.layers.len();
        self.layers.get_mut(layer).ok_or_else(|| {
            Error::Generation(format!(
                "decode state holds {num_layers} layers, layer {layer} requested"
            ))
        })
    }

    pub(crate) fn advance(&mut self, positions: usize) {
        self.seq_len += positions;
    }
}

/// A model that can be evaluated one step at a time against a
/// [`DecodeState`].
pub trait StreamingModel {
    /// Feeds `new_ids` (positions `state.seq_len()..`) and returns the
    /// vocabulary logits of the last position, shape `[vocab]`.
    fn next_token_logits(&self, new_ids: &[u32], state: &mut DecodeState) -> Result<Tensor>;

    /// Fresh decode state sized for this model.
    fn decode_state(&self) -> DecodeState;

    /// Longest sequence the model accepts.
    fn max_seq_len(&self) -> usize;
}

/// Lazy, finite stream of generated token ids.
///
/// Yields exactly `max_length - prompt_len` tokens; stopping at EOS is left
/// to the consumer. After an error the stream is exhausted.
pub struct TokenStream<'a, M: StreamingModel, R: Rng> {
    model: &'a M,
    state: DecodeState,
    pending: Vec<u32>,
    remaining: usize,
    sampling: Sampling,
    temperature: f64,
    rng: R,
}

impl<'a, M: StreamingModel, R: Rng> TokenStream<'a, M, R> {
    pub fn new(
        model: &'a M,
        prompt_ids: &[u32],
        max_length: usize,
        sampling: Sampling,
        temperature: f64,
        rng: R,
    ) -> Result<Self> {
        sampling.validate()?;
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(Error::InvalidTemperature(temperature));
        }
        if prompt_ids.is_empty() {
            return Err(Error::Generation("prompt must not be empty".into()));
        }
        if max_length > model.max_seq_len() {
            return Err(Error::Generation(format!(
                "max_length {max_length} exceeds model context {}",
                model.max_seq_len()
            )));
        }
        Ok(Self {
            model,
            state: model.decode_state(),
            pending: prompt_ids.to_vec(),
            remaining: max_length.saturating_sub(prompt_ids.len()),
            sampling,
            temperature,
            rng,
        })
    }

    fn step(&mut self) -> Result<u32> {
        let logits = self.model.next_token_logits(&self.pending, &mut self.state)?;
        let probs = softmax_with_temperature(&logits, self.temperature)?;
        let probs: Vec<f32> = probs.to_dtype(candle_core::DType::F32)?.to_vec1()?;
        let token = self.sampling.sample(&probs, &mut self.rng)?;
        self.pending.clear();
        self.pending.push(token);
        Ok(token)
    }
}

impl<M: StreamingModel, R: Rng> Iterator for TokenStream<'_, M, R> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let token = self.step();
        if token.is_err() {
            self.remaining = 0;
        }
        Some(token)
    }
}

/// Nucleus-sampled token stream for `prompt_ids`, up to `max_length` total
/// positions.
pub fn stream<'a, M: StreamingModel, R: Rng>(
    model: &'a M,
    prompt_ids: &[u32],
    max_length: usize,
    prob_threshold: f32,
    temperature: f64,
    rng: R,
) -> Result<TokenStream<'a, M, R>> {
    TokenStream::new(
        model,
        prompt_ids,
        max_length,
        Sampling::Nucleus {
            top_p: prob_threshold,
        },
        temperature,
        rng,
    )
}

/// Prints `prompt` followed by its streamed continuation to stdout, stopping
/// right after the EOS token is printed. Returns the generated ids.
pub fn print_stream<M: StreamingModel, R: Rng>(
    model: &M,
    tokenizer: &Tokenizer,
    prompt: &str,
    max_length: usize,
    sampling: Sampling,
    temperature: f64,
    rng: R,
) -> Result<Vec<u32>> {
    let prompt_ids = tokenizer.encode(prompt, false)?;
    let mut out = std::io::stdout().lock();
    write!(out, "{prompt}")?;
    out.flush()?;

    let mut generated = Vec::new();
    for token in TokenStream::new(model, &prompt_ids, max_length, sampling, temperature, rng)? {
        let token = token?;
        generated.push(token);
        write!(out, "{}", tokenizer.decode(&[token], false)?)?;
        out.flush()?;
        // After the print, so the EOS token itself is visible.
        if token == tokenizer.eos_token_id() {
            break;
        }
    }
    writeln!(out)?;
    out.flush()?;
    Ok(generated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::cell::RefCell;

    /// Always favours `(last token + 1) % vocab`, recording what it was fed.
    struct CountingModel {
        vocab: usize,
        max_seq_len: usize,
        calls: RefCell<Vec<(usize, Vec<u32>)>>,
    }

    impl CountingModel {
        fn new(vocab: usize, max_seq_len: usize) -> Self {
            Self {
                vocab,
                max_seq_len,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl StreamingModel for CountingModel {
        fn next_token_logits(&self, new_ids: &[u32], state: &mut DecodeState) -> Result<Tensor> {
            self.calls
                .borrow_mut()
                .push((state.seq_len(), new_ids.to_vec()));
            state.advance(new_ids.len());
            let next = (*new_ids.last().unwrap() as usize + 1) % self.vocab;
            let mut logits = vec![-1e4f32; self.vocab];
            logits[next] = 10.0;
            Ok(Tensor::new(logits, &Device::Cpu)?)
        }

        fn decode_state(&self) -> DecodeState {
            DecodeState::new(1)
        }

        fn max_seq_len(&self) -> usize {
            self.max_seq_len
        }
    }

    #[test]
    fn test_stream_yields_max_length_minus_prompt() {
        let model = CountingModel::new(10, 32);
        let tokens: Vec<u32> = stream(&model, &[1, 2, 3], 8, 0.9, 1.0, StdRng::seed_from_u64(0))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(tokens, vec![4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_stream_feeds_prompt_once_then_single_tokens() {
        let model = CountingModel::new(10, 32);
        let _ = stream(&model, &[1, 2, 3], 6, 1.0, 1.0, StdRng::seed_from_u64(0))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let calls = model.calls.borrow();
        assert_eq!(
            *calls,
            vec![(0, vec![1, 2, 3]), (3, vec![4]), (4, vec![5])]
        );
    }

    #[test]
    fn test_stream_wraps_and_can_stop_at_eos() {
        let model = CountingModel::new(5, 32);
        let eos = 0;
        let mut generated = Vec::new();
        for token in TokenStream::new(
            &model,
            &[2],
            20,
            Sampling::Greedy,
            1.0,
            StdRng::seed_from_u64(0),
        )
        .unwrap()
        {
            let token = token.unwrap();
            generated.push(token);
            if token == eos {
                break;
            }
        }
        assert_eq!(generated, vec![3, 4, 0]);
    }

    #[test]
    fn test_stream_with_long_prompt_yields_nothing() {
        let model = CountingModel::new(10, 32);
        let mut s = stream(&model, &[1, 2, 3, 4], 3, 0.9, 1.0, StdRng::seed_from_u64(0)).unwrap();
        assert!(s.next().is_none());
        assert!(model.calls.borrow().is_empty());
    }

    #[test]
    fn test_stream_rejects_invalid_arguments() {
        let model = CountingModel::new(10, 8);
        let rng = || StdRng::seed_from_u64(0);
        assert!(matches!(
            stream(&model, &[1], 4, 0.9, 0.0, rng()),
            Err(Error::InvalidTemperature(_))
        ));
        assert!(matches!(
            stream(&model, &[1], 4, 1.1, 1.0, rng()),
            Err(Error::InvalidThreshold(_))
        ));
        assert!(matches!(
            stream(&model, &[], 4, 0.9, 1.0, rng()),
            Err(Error::Generation(_))
        ));
        assert!(matches!(
            stream(&model, &[1], 9, 0.9, 1.0, rng()),
            Err(Error::Generation(_))
        ));
    }

    #[test]
    fn test_decode_state_reset() {
        let mut state = DecodeState::new(2);
        state.advance(5);
        *state.layer_mut(1).unwrap() = Some((
            Tensor::zeros(1, candle_core::DType::F32, &Device::Cpu).unwrap(),
            Tensor::zeros(1, candle_core::DType::F32, &Device::Cpu).unwrap(),
        ));
        state.reset();
        assert_eq!(state.seq_len(), 0);
        assert!(state.layer_mut(1).unwrap().is_none());
        assert!(state.layer_mut(2).is_err());
    }
}
