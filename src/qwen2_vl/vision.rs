use super::{ModelError, config::VisionConfig};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder, layer_norm, linear, ops::softmax_last_dim};

const LAYER_NORM_EPS: f64 = 1e-6;

/// Qwen2-VL vision tower: patch embedding, transformer blocks with 2D
/// rotary attention and the 2x2 patch merger.
#[derive(Debug)]
pub struct VisionTransformer {
    patch_embed: Tensor,
    blocks: Vec<VisionBlock>,
    merger: PatchMerger,
    rotary: VisionRotary,
    merge_size: usize,
}

impl VisionTransformer {
    pub fn load(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        // stored as a Conv3d kernel whose stride equals its size, so it is a
        // plain projection of the flattened patch
        let patch_embed = vb
            .pp("patch_embed.proj")
            .get(
                (
                    cfg.embed_dim,
                    cfg.in_chans,
                    cfg.temporal_patch_size,
                    cfg.patch_size,
                    cfg.patch_size,
                ),
                "weight",
            )?
            .reshape((cfg.embed_dim, cfg.patch_dim()))?;

        let blocks = (0..cfg.depth)
            .map(|idx| VisionBlock::load(cfg, vb.pp(format!("blocks.{idx}"))))
            .collect::<Result<Vec<_>, _>>()?;
        let merger = PatchMerger::load(cfg, vb.pp("merger"))?;
        let rotary = VisionRotary::new(cfg.head_dim());

        Ok(Self {
            patch_embed,
            blocks,
            merger,
            rotary,
            merge_size: cfg.spatial_merge_size,
        })
    }

    /// `pixel_values` is `(patches, patch_dim)` in merge-block order; the
    /// result has one row per merged token.
    pub fn forward(&self, pixel_values: &Tensor, grid_thw: [usize; 3]) -> Result<Tensor, ModelError> {
        let pixel_values = pixel_values.to_dtype(self.patch_embed.dtype())?;
        let mut hidden = pixel_values.matmul(&self.patch_embed.t()?)?;

        let positions = patch_positions(grid_thw, self.merge_size);
        if positions.len() != hidden.dim(0)? {
            return Err(ModelError::Input(format!(
                "grid {grid_thw:?} describes {} patches, got {}",
                positions.len(),
                hidden.dim(0)?
            )));
        }
        let (cos, sin) = self.rotary.tables(&positions, hidden.device())?;

        for block in &self.blocks {
            hidden = block.forward(&hidden, &cos, &sin)?;
        }
        self.merger.forward(&hidden)
    }
}

/// `(row, column)` of every patch, in the same merge-block order as the
/// flattened pixels.
pub fn patch_positions(grid_thw: [usize; 3], merge: usize) -> Vec<[u32; 2]> {
    let [t, h, w] = grid_thw;
    let mut positions = Vec::with_capacity(t * h * w);
    for _ in 0..t {
        for bh in 0..h / merge {
            for bw in 0..w / merge {
                for ih in 0..merge {
                    for iw in 0..merge {
                        positions.push([(bh * merge + ih) as u32, (bw * merge + iw) as u32]);
                    }
                }
            }
        }
    }
    positions
}

#[derive(Debug)]
struct VisionRotary {
    inv_freq: Vec<f32>,
}

impl VisionRotary {
    fn new(head_dim: usize) -> Self {
        // half the head rotates with the row, half with the column
        let rope_dim = head_dim / 2;
        let inv_freq = (0..rope_dim / 2)
            .map(|i| 1.0 / 10_000f32.powf((2 * i) as f32 / rope_dim as f32))
            .collect();
        Self { inv_freq }
    }

    /// Cos/sin tables of shape `(patches, head_dim / 2)`, f32.
    fn tables(&self, positions: &[[u32; 2]], device: &Device) -> Result<(Tensor, Tensor), ModelError> {
        let width = self.inv_freq.len() * 2;
        let mut angles = Vec::with_capacity(positions.len() * width);
        for &[row, col] in positions {
            angles.extend(self.inv_freq.iter().map(|f| row as f32 * f));
            angles.extend(self.inv_freq.iter().map(|f| col as f32 * f));
        }
        let angles = Tensor::from_vec(angles, (positions.len(), width), device)?;
        Ok((angles.cos()?, angles.sin()?))
    }
}

#[derive(Debug)]
struct VisionBlock {
    norm1: LayerNorm,
    norm2: LayerNorm,
    attn: VisionAttention,
    fc1: Linear,
    fc2: Linear,
}

impl VisionBlock {
    fn load(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        Ok(Self {
            norm1: layer_norm(cfg.embed_dim, LAYER_NORM_EPS, vb.pp("norm1"))?,
            norm2: layer_norm(cfg.embed_dim, LAYER_NORM_EPS, vb.pp("norm2"))?,
            attn: VisionAttention::load(cfg, vb.pp("attn"))?,
            fc1: linear(cfg.embed_dim, cfg.mlp_dim(), vb.pp("mlp.fc1"))?,
            fc2: linear(cfg.mlp_dim(), cfg.embed_dim, vb.pp("mlp.fc2"))?,
        })
    }

    fn forward(&self, hidden: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor, ModelError> {
        let attn = self.attn.forward(&self.norm1.forward(hidden)?, cos, sin)?;
        let hidden = (hidden + attn)?;
        let mlp = self.fc1.forward(&self.norm2.forward(&hidden)?)?;
        let mlp = self.fc2.forward(&quick_gelu(&mlp)?)?;
        Ok((hidden + mlp)?)
    }
}

fn quick_gelu(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs * candle_nn::ops::sigmoid(&xs.affine(1.702, 0.0)?)?
}

#[derive(Debug)]
struct VisionAttention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl VisionAttention {
    fn load(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        Ok(Self {
            qkv: linear(cfg.embed_dim, cfg.embed_dim * 3, vb.pp("qkv"))?,
            proj: linear(cfg.embed_dim, cfg.embed_dim, vb.pp("proj"))?,
            num_heads: cfg.num_heads,
            head_dim: cfg.head_dim(),
        })
    }

    // a single image is one frame, so every patch attends to every other
    fn forward(&self, hidden: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor, ModelError> {
        let seq = hidden.dim(0)?;
        let qkv = self
            .qkv
            .forward(hidden)?
            .reshape((seq, 3, self.num_heads, self.head_dim))?
            .permute((1, 2, 0, 3))?;
        let dtype = qkv.dtype();

        let rotate = |idx: usize| -> candle_core::Result<Tensor> {
            let x = qkv.get(idx)?.unsqueeze(0)?.to_dtype(DType::F32)?.contiguous()?;
            candle_nn::rotary_emb::rope(&x, cos, sin)?.to_dtype(dtype)
        };
        let q = rotate(0)?;
        let k = rotate(1)?;
        let v = qkv.get(2)?.unsqueeze(0)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let probs = softmax_last_dim(&scores.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
        let out = probs
            .matmul(&v)?
            .squeeze(0)?
            .transpose(0, 1)?
            .reshape((seq, self.num_heads * self.head_dim))?;
        Ok(self.proj.forward(&out)?)
    }
}

#[derive(Debug)]
struct PatchMerger {
    ln_q: LayerNorm,
    mlp_in: Linear,
    mlp_out: Linear,
    merged_dim: usize,
}

impl PatchMerger {
    fn load(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self, ModelError> {
        let merged_dim = cfg.embed_dim * cfg.spatial_merge_size * cfg.spatial_merge_size;
        Ok(Self {
            ln_q: layer_norm(cfg.embed_dim, LAYER_NORM_EPS, vb.pp("ln_q"))?,
            mlp_in: linear(merged_dim, merged_dim, vb.pp("mlp.0"))?,
            mlp_out: linear(merged_dim, cfg.hidden_size, vb.pp("mlp.2"))?,
            merged_dim,
        })
    }

    fn forward(&self, hidden: &Tensor) -> Result<Tensor, ModelError> {
        let merged = self
            .ln_q
            .forward(hidden)?
            .reshape(((), self.merged_dim))?;
        let merged = self.mlp_in.forward(&merged)?.gelu_erf()?;
        Ok(self.mlp_out.forward(&merged)?)
    }
}
