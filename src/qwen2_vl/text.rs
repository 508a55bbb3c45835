use super::{ModelError, config::Qwen2VlConfig};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{
    Embedding, Linear, RmsNorm, VarBuilder, embedding, linear, linear_no_bias,
    ops::softmax_last_dim, rms_norm, rotary_emb::rope,
};
use candle_transformers::utils::repeat_kv;

/// Position of a token on the temporal, height and width rotary axes.
pub type MropePosition = [u32; 3];

/// Assigns multimodal rotary positions to a prompt holding one image.
///
/// Text tokens share one index on all three axes. The run of image tokens
/// starting at the first `image_token_id` is laid out on the merged patch
/// grid, offset by the preceding text. Returns the positions and the next
/// free index, which is where generated tokens continue.
pub fn mrope_positions(
    ids: &[u32],
    image_token_id: u32,
    grid_thw: [usize; 3],
    merge: usize,
) -> (Vec<MropePosition>, u32) {
    let [t, h, w] = grid_thw;
    let (grid_h, grid_w) = (h / merge, w / merge);
    let image_len = t * grid_h * grid_w;

    let mut positions = Vec::with_capacity(ids.len());
    let mut next = 0u32;
    let mut idx = 0usize;
    let mut image_placed = false;
    while idx < ids.len() {
        if !image_placed && ids[idx] == image_token_id && image_len > 0 {
            for ti in 0..t {
                for hi in 0..grid_h {
                    for wi in 0..grid_w {
                        positions.push([next + ti as u32, next + hi as u32, next + wi as u32]);
                    }
                }
            }
            next += t.max(grid_h).max(grid_w) as u32;
            idx += image_len;
            image_placed = true;
        } else {
            positions.push([next; 3]);
            next += 1;
            idx += 1;
        }
    }
    positions.truncate(ids.len());
    (positions, next)
}

#[derive(Debug)]
struct MultimodalRotary {
    inv_freq: Vec<f32>,
    /// Axis (0 = t, 1 = h, 2 = w) driving each frequency.
    axis: Vec<usize>,
}

impl MultimodalRotary {
    fn new(cfg: &Qwen2VlConfig) -> Self {
        let head_dim = cfg.head_dim();
        let inv_freq: Vec<f32> = (0..head_dim / 2)
            .map(|i| 1.0 / (cfg.rope_theta as f32).powf((2 * i) as f32 / head_dim as f32))
            .collect();
        let mut axis = Vec::with_capacity(inv_freq.len());
        for (section_axis, &len) in cfg.rope_scaling.mrope_section.iter().enumerate() {
            axis.extend(std::iter::repeat_n(section_axis.min(2), len));
        }
        axis.resize(inv_freq.len(), 2);
        Self { inv_freq, axis }
    }

    /// Cos/sin tables of shape `(seq, head_dim / 2)`.
    fn tables(
        &self,
        positions: &[MropePosition],
        device: &Device,
        dtype: DType,
    ) -> Result<(Tensor, Tensor), ModelError> {
        let mut angles = Vec::with_capacity(positions.len() * self.inv_freq.len());
        for position in positions {
            angles.extend(
                self.inv_freq
                    .iter()
                    .zip(&self.axis)
                    .map(|(freq, &axis)| position[axis] as f32 * freq),
            );
        }
        let angles = Tensor::from_vec(angles, (positions.len(), self.inv_freq.len()), device)?;
        Ok((angles.cos()?.to_dtype(dtype)?, angles.sin()?.to_dtype(dtype)?))
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn load(cfg: &Qwen2VlConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        let head_dim = cfg.head_dim();
        let kv_dim = cfg.num_key_value_heads * head_dim;
        Ok(Self {
            q_proj: linear(cfg.hidden_size, cfg.hidden_size, vb.pp("q_proj"))?,
            k_proj: linear(cfg.hidden_size, kv_dim, vb.pp("k_proj"))?,
            v_proj: linear(cfg.hidden_size, kv_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(cfg.hidden_size, cfg.hidden_size, vb.pp("o_proj"))?,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_key_value_heads,
            head_dim,
            kv_cache: None,
        })
    }

    fn forward(
        &mut self,
        hidden: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, ModelError> {
        let (batch, seq, _) = hidden.dims3()?;
        let split = |proj: &Linear, heads: usize| -> candle_core::Result<Tensor> {
            proj.forward(hidden)?
                .reshape((batch, seq, heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = rope(&split(&self.q_proj, self.num_heads)?, cos, sin)?;
        let k = rope(&split(&self.k_proj, self.num_kv_heads)?, cos, sin)?;
        let v = split(&self.v_proj, self.num_kv_heads)?;

        let (k, v) = match &self.kv_cache {
            Some((past_k, past_v)) => (Tensor::cat(&[past_k, &k], 2)?, Tensor::cat(&[past_v, &v], 2)?),
            None => (k, v),
        };
        self.kv_cache = Some((k.clone(), v.clone()));

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut scores = (q.matmul(&k.t()?)? * scale)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }
        let probs = softmax_last_dim(&scores)?;
        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq, self.num_heads * self.head_dim))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

#[derive(Debug)]
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(cfg: &Qwen2VlConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        Ok(Self {
            gate_proj: linear_no_bias(cfg.hidden_size, cfg.intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(cfg.hidden_size, cfg.intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(cfg.intermediate_size, cfg.hidden_size, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let gate = self.gate_proj.forward(xs)?.silu()?;
        self.down_proj.forward(&(gate * self.up_proj.forward(xs)?)?)
    }
}

#[derive(Debug)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(cfg: &Qwen2VlConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        Ok(Self {
            self_attn: Attention::load(cfg, vb.pp("self_attn"))?,
            mlp: Mlp::load(cfg, vb.pp("mlp"))?,
            input_layernorm: rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &mut self,
        hidden: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, ModelError> {
        let attn = self
            .self_attn
            .forward(&self.input_layernorm.forward(hidden)?, cos, sin, mask)?;
        let hidden = (hidden + attn)?;
        let mlp = self.mlp.forward(&self.post_attention_layernorm.forward(&hidden)?)?;
        Ok((hidden + mlp)?)
    }
}

/// Qwen2 decoder with multimodal rotary positions and a per-layer KV cache.
#[derive(Debug)]
pub struct TextModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: MultimodalRotary,
    device: Device,
    dtype: DType,
}

impl TextModel {
    pub fn load(cfg: &Qwen2VlConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("model.embed_tokens"))?;
        let layers = (0..cfg.num_hidden_layers)
            .map(|idx| DecoderLayer::load(cfg, vb.pp(format!("model.layers.{idx}"))))
            .collect::<Result<Vec<_>, _>>()?;
        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("model.norm"))?;
        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary: MultimodalRotary::new(cfg),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Embeds `(batch, seq)` token ids.
    pub fn embed(&self, ids: &Tensor) -> Result<Tensor, ModelError> {
        Ok(self.embed_tokens.forward(ids)?)
    }

    /// Runs `(1, seq, hidden)` embeddings through the decoder, extending the
    /// KV cache, and returns f32 logits of the last position.
    pub fn forward(
        &mut self,
        embeds: &Tensor,
        positions: &[MropePosition],
    ) -> Result<Tensor, ModelError> {
        let (_, seq, _) = embeds.dims3()?;
        if positions.len() != seq {
            return Err(ModelError::Input(format!(
                "{} rotary positions for {seq} tokens",
                positions.len()
            )));
        }
        let (cos, sin) = self.rotary.tables(positions, &self.device, self.dtype)?;
        let mask = if seq > 1 {
            Some(causal_mask(seq, &self.device, self.dtype)?)
        } else {
            None
        };

        let mut hidden = embeds.clone();
        for layer in &mut self.layers {
            hidden = layer.forward(&hidden, &cos, &sin, mask.as_ref())?;
        }
        let last = self.norm.forward(&hidden.narrow(1, seq - 1, 1)?)?;
        Ok(self
            .lm_head
            .forward(&last)?
            .squeeze(0)?
            .squeeze(0)?
            .to_dtype(DType::F32)?)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in &mut self.layers {
            layer.self_attn.kv_cache = None;
        }
    }
}

// prefill only; later steps see the whole cache
fn causal_mask(seq: usize, device: &Device, dtype: DType) -> candle_core::Result<Tensor> {
    let mask: Vec<f32> = (0..seq)
        .flat_map(|i| (0..seq).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_slice(&mask, (seq, seq), device)?
        .to_dtype(dtype)?
        .reshape((1, 1, seq, seq))
}
