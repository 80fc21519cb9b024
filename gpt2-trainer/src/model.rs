use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Dropout, Embedding, Init, Linear, VarBuilder, linear, linear_no_bias};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::generate::{DecodeState, StreamingModel};

/// Role of a trainable tensor, fixed when the model is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Weight,
    Embedding,
    Bias,
    Norm,
}

impl ParamKind {
    /// Whether weight decay applies. Biases and normalization scales are
    /// left unregularized.
    pub fn regularizable(self) -> bool {
        matches!(self, ParamKind::Weight | ParamKind::Embedding)
    }
}

#[derive(Debug, Clone)]
pub struct TaggedParam {
    pub tensor: Tensor,
    pub kind: ParamKind,
}

fn tag(out: &mut Vec<TaggedParam>, tensor: &Tensor, kind: ParamKind) {
    out.push(TaggedParam {
        tensor: tensor.clone(),
        kind,
    });
}

fn tag_linear(out: &mut Vec<TaggedParam>, layer: &Linear) {
    tag(out, layer.weight(), ParamKind::Weight);
    if let Some(bias) = layer.bias() {
        tag(out, bias, ParamKind::Bias);
    }
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> candle_core::Result<Tensor> {
    let shape = on_false.shape();
    let mask = mask.broadcast_as(shape.dims())?;
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

/// Causal mask for `seq_len` new positions attending over `offset` cached
/// ones. `1` marks a blocked pair. Shape `[1, 1, seq_len, offset + seq_len]`.
fn causal_mask(seq_len: usize, offset: usize, device: &Device) -> candle_core::Result<Tensor> {
    let total = offset + seq_len;
    let mask: Vec<u8> = (0..seq_len)
        .flat_map(|i| (0..total).map(move |j| u8::from(j > offset + i)))
        .collect();
    Tensor::from_vec(mask, (seq_len, total), device)?
        .unsqueeze(0)?
        .unsqueeze(0)
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> candle_core::Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    fn collect_params(&self, out: &mut Vec<TaggedParam>) {
        tag(out, &self.weight, ParamKind::Norm);
        tag(out, &self.bias, ParamKind::Norm);
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_sub(&mean)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x = x.to_dtype(dtype)?;
        x.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

pub struct CausalSelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    dropout: Dropout,
}

impl CausalSelfAttention {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let h = config.hidden_size;
        Ok(Self {
            q_proj: linear(h, h, vb.pp("q_proj"))?,
            k_proj: linear(h, h, vb.pp("k_proj"))?,
            v_proj: linear(h, h, vb.pp("v_proj"))?,
            o_proj: linear(h, h, vb.pp("o_proj"))?,
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
            dropout: Dropout::new(config.dropout as f32),
        })
    }

    fn split_heads(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        x.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `cache`, when present, holds keys/values of earlier positions and is
    /// extended with the new ones.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;

        let q = self.split_heads(&self.q_proj.forward(x)?)?;
        let k = self.split_heads(&self.k_proj.forward(x)?)?;
        let v = self.split_heads(&self.v_proj.forward(x)?)?;

        let (k, v) = match cache {
            Some(slot) => {
                let (k, v) = match slot.take() {
                    Some((prev_k, prev_v)) => (
                        Tensor::cat(&[&prev_k, &k], 2)?.contiguous()?,
                        Tensor::cat(&[&prev_v, &v], 2)?.contiguous()?,
                    ),
                    None => (k, v),
                };
                *slot = Some((k.clone(), v.clone()));
                (k, v)
            }
            None => (k, v),
        };

        // Flash attention only covers the uncached full-sequence case.
        #[cfg(feature = "flash-attn")]
        let use_flash = mask.is_some() && k.dim(2)? == seq_len;
        #[cfg(not(feature = "flash-attn"))]
        let use_flash = false;
        if use_flash {
            let attn = self.flash_attention(&q, &k, &v)?;
            let attn = attn.reshape((batch_size, seq_len, self.num_heads * self.head_dim))?;
            return self.o_proj.forward(&attn);
        }

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let attn_weights = q.matmul(&k_t)?.affine(1.0 / scale, 0.0)?;
        let attn_weights = match mask {
            Some(m) => masked_fill(&attn_weights, m, f32::NEG_INFINITY)?,
            None => attn_weights,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;

        let output = attn_weights.matmul(&v)?;
        let output = output.transpose(1, 2)?.contiguous()?;
        let output = output.reshape((batch_size, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&output)
    }

    #[cfg(feature = "flash-attn")]
    fn flash_attention(&self, q: &Tensor, k: &Tensor, v: &Tensor) -> candle_core::Result<Tensor> {
        // Flash attention expects (batch, seq, heads, head_dim)
        let q = q.transpose(1, 2)?;
        let k = k.transpose(1, 2)?;
        let v = v.transpose(1, 2)?;
        let softmax_scale = 1.0 / (self.head_dim as f32).sqrt();
        candle_flash_attn::flash_attn(&q, &k, &v, softmax_scale, true)
    }

    #[cfg(not(feature = "flash-attn"))]
    fn flash_attention(&self, _q: &Tensor, _k: &Tensor, _v: &Tensor) -> candle_core::Result<Tensor> {
        candle_core::bail!("flash attention requires the flash-attn feature")
    }

    fn collect_params(&self, out: &mut Vec<TaggedParam>) {
        for proj in [&self.q_proj, &self.k_proj, &self.v_proj, &self.o_proj] {
            tag_linear(out, proj);
        }
    }
}

pub struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
    dropout: Dropout,
}

impl Mlp {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            c_fc: linear(config.hidden_size, config.intermediate_size, vb.pp("c_fc"))?,
            c_proj: linear(config.intermediate_size, config.hidden_size, vb.pp("c_proj"))?,
            dropout: Dropout::new(config.dropout as f32),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let hidden = self.c_fc.forward(x)?.gelu()?;
        let out = self.c_proj.forward(&hidden)?;
        self.dropout.forward(&out, train)
    }

    fn collect_params(&self, out: &mut Vec<TaggedParam>) {
        tag_linear(out, &self.c_fc);
        tag_linear(out, &self.c_proj);
    }
}

pub struct TransformerBlock {
    ln_1: LayerNorm,
    attention: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
    dropout: Dropout,
}

impl TransformerBlock {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            ln_1: LayerNorm::new(config.hidden_size, config.layer_norm_eps, vb.pp("ln_1"))?,
            attention: CausalSelfAttention::new(config, vb.pp("attention"))?,
            ln_2: LayerNorm::new(config.hidden_size, config.layer_norm_eps, vb.pp("ln_2"))?,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
            dropout: Dropout::new(config.dropout as f32),
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        cache: Option<&mut Option<(Tensor, Tensor)>>,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let residual = x;
        let h = self.ln_1.forward(x)?;
        let h = self.attention.forward(&h, mask, cache, train)?;
        let h = self.dropout.forward(&h, train)?;
        let x = (residual + h)?;

        let residual = &x;
        let h = self.ln_2.forward(&x)?;
        let h = self.mlp.forward(&h, train)?;
        residual + h
    }

    fn collect_params(&self, out: &mut Vec<TaggedParam>) {
        self.ln_1.collect_params(out);
        self.attention.collect_params(out);
        self.ln_2.collect_params(out);
        self.mlp.collect_params(out);
    }
}

/// GPT-2 style decoder: learned token and position embeddings, pre-norm
/// blocks, final LayerNorm and an untied LM head.
pub struct GPT {
    wte: Embedding,
    wpe: Embedding,
    layers: Vec<TransformerBlock>,
    ln_f: LayerNorm,
    lm_head: Linear,
    dropout: Dropout,
    config: ModelConfig,
}

impl GPT {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let init = Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };
        let wte = vb.pp("wte").get_with_hints(
            (config.vocab_size, config.hidden_size),
            "weight",
            init,
        )?;
        let wpe = vb.pp("wpe").get_with_hints(
            (config.max_seq_len, config.hidden_size),
            "weight",
            init,
        )?;
        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(TransformerBlock::new(config, vb.pp(format!("h.{}", i)))?);
        }
        let ln_f = LayerNorm::new(config.hidden_size, config.layer_norm_eps, vb.pp("ln_f"))?;
        let lm_head = linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?;
        Ok(Self {
            wte: Embedding::new(wte, config.hidden_size),
            wpe: Embedding::new(wpe, config.hidden_size),
            layers,
            ln_f,
            lm_head,
            dropout: Dropout::new(config.dropout as f32),
            config: config.clone(),
        })
    }

    /// Full-sequence forward pass, `input_ids: [batch, seq]` ->
    /// `[batch, seq, vocab]`. `train` enables dropout.
    pub fn forward(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        self.run(input_ids, None, train)
    }

    /// Forward pass over new positions only, reusing and extending `state`.
    pub fn forward_cached(&self, input_ids: &Tensor, state: &mut DecodeState) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let logits = self.run(input_ids, Some(state), false)?;
        state.advance(seq_len);
        Ok(logits)
    }

    fn run(
        &self,
        input_ids: &Tensor,
        mut state: Option<&mut DecodeState>,
        train: bool,
    ) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let offset = state.as_ref().map_or(0, |s| s.seq_len());
        if offset + seq_len > self.config.max_seq_len {
            return Err(Error::Generation(format!(
                "sequence of {} positions exceeds context length {}",
                offset + seq_len,
                self.config.max_seq_len
            )));
        }

        let device = input_ids.device();
        let positions: Vec<u32> = (offset as u32..(offset + seq_len) as u32).collect();
        let positions = Tensor::new(positions, device)?.unsqueeze(0)?;
        let x = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;
        let mut x = self.dropout.forward(&x, train)?;

        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, offset, device)?)
        } else {
            None
        };

        for (i, layer) in self.layers.iter().enumerate() {
            let cache = match state.as_deref_mut() {
                Some(s) => Some(s.layer_mut(i)?),
                None => None,
            };
            x = layer.forward(&x, mask.as_ref(), cache, train)?;
        }

        let x = self.ln_f.forward(&x)?;
        Ok(self.lm_head.forward(&x)?)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Every trainable tensor with its role.
    pub fn tagged_params(&self) -> Vec<TaggedParam> {
        let mut out = Vec::new();
        tag(&mut out, self.wte.embeddings(), ParamKind::Embedding);
        tag(&mut out, self.wpe.embeddings(), ParamKind::Embedding);
        for layer in &self.layers {
            layer.collect_params(&mut out);
        }
        self.ln_f.collect_params(&mut out);
        tag_linear(&mut out, &self.lm_head);
        out
    }

    pub fn num_parameters(&self) -> usize {
        self.tagged_params()
            .iter()
            .map(|p| p.tensor.elem_count())
            .sum()
    }
}

impl StreamingModel for GPT {
    fn next_token_logits(&self, new_ids: &[u32], state: &mut DecodeState) -> Result<Tensor> {
        let device = self.wte.embeddings().device();
        let input = Tensor::new(new_ids, device)?.unsqueeze(0)?;
        let logits = self.forward_cached(&input, state)?;
        let last = logits.dim(1)? - 1;
        Ok(logits.narrow(1, last, 1)?.squeeze(1)?.squeeze(0)?)
    }

    fn decode_state(&self) -> DecodeState {
        DecodeState::new(self.config.num_layers)
    }

    fn max_seq_len(&self) -> usize {
        self.config.max_seq_len
    }
}

/// Mean token cross-entropy over targets that are not `pad_id`.
///
/// `logits: [batch, seq, vocab]`, `targets: [batch, seq]` (u32). Returns a
/// scalar; zero when every target is padding.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, pad_id: u32) -> Result<Tensor> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    let n = batch_size * seq_len;
    let logits = logits.reshape((n, vocab_size))?.to_dtype(DType::F32)?;
    let targets = targets.reshape((n,))?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?;
    let mask = targets.ne(pad_id)?.to_dtype(DType::F32)?;
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    let total = (picked * &mask)?.sum_all()?.neg()?;
    Ok(total.affine(1.0 / count.max(1.0) as f64, 0.0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 11,
            max_seq_len: 16,
            hidden_size: 16,
            num_layers: 2,
            num_heads: 2,
            intermediate_size: 32,
            dropout: 0.0,
            layer_norm_eps: 1e-5,
        }
    }

    fn build() -> (GPT, VarMap) {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let model = GPT::new(&tiny_config(), vb).unwrap();
        (model, var_map)
    }

    #[test]
    fn test_forward_shape() {
        let (model, _) = build();
        let input = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 7, 8]], &Device::Cpu).unwrap();
        let logits = model.forward(&input, false).unwrap();
        assert_eq!(logits.dims(), &[2, 4, 11]);
    }

    #[test]
    fn test_cached_decode_matches_full_forward() {
        let (model, _) = build();
        let ids = [3u32, 1, 4, 1, 5];
        let full = model
            .forward(&Tensor::new(&ids, &Device::Cpu).unwrap().unsqueeze(0).unwrap(), false)
            .unwrap();
        let expected: Vec<f32> = full.get(0).unwrap().get(4).unwrap().to_vec1().unwrap();

        let mut state = model.decode_state();
        model.next_token_logits(&ids[..3], &mut state).unwrap();
        model.next_token_logits(&ids[3..4], &mut state).unwrap();
        let got: Vec<f32> = model
            .next_token_logits(&ids[4..], &mut state)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(state.seq_len(), 5);
        for (a, b) in expected.iter().zip(&got) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_context_overflow_is_rejected() {
        let (model, _) = build();
        let mut state = model.decode_state();
        let ids: Vec<u32> = (0..16).map(|i| i % 11).collect();
        model.next_token_logits(&ids, &mut state).unwrap();
        assert!(model.next_token_logits(&[1], &mut state).is_err());
    }

    #[test]
    fn test_tagged_params_cover_var_map() {
        let (model, var_map) = build();
        let tagged = model.tagged_params();
        assert_eq!(tagged.len(), var_map.all_vars().len());

        let decayed = tagged.iter().filter(|p| p.kind.regularizable()).count();
        // wte, wpe, lm_head, and 6 matrices per layer.
        assert_eq!(decayed, 3 + 2 * 6);
        assert!(
            tagged
                .iter()
                .filter(|p| p.tensor.rank() == 1)
                .all(|p| !p.kind.regularizable())
        );
    }

    #[test]
    fn test_masked_cross_entropy_ignores_padding() {
        let device = Device::Cpu;
        // Uniform logits -> per-token loss ln(4).
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let targets = Tensor::new(&[[1u32, 0, 2]], &device).unwrap();
        let loss = masked_cross_entropy(&logits, &targets, 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);

        let all_pad = Tensor::new(&[[0u32, 0, 0]], &device).unwrap();
        let loss = masked_cross_entropy(&logits, &all_pad, 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_masked_cross_entropy_prefers_correct_logits() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[[0.0f32, 5.0, 0.0]]], &device).unwrap();
        let right = Tensor::new(&[[1u32]], &device).unwrap();
        let wrong = Tensor::new(&[[2u32]], &device).unwrap();
        let l_right = masked_cross_entropy(&logits, &right, 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let l_wrong = masked_cross_entropy(&logits, &wrong, 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(l_right < l_wrong);
    }
}
