use super::ModelError;
use serde::Deserialize;
use std::path::Path;

/// Text decoder and vision tower hyper-parameters read from `config.json`.
///
/// Missing fields fall back to the Qwen2-VL-2B values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Qwen2VlConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub tie_word_embeddings: bool,
    pub image_token_id: u32,
    pub eos_token_id: u32,
    pub rope_scaling: RopeScaling,
    pub vision_config: VisionConfig,
}

impl Default for Qwen2VlConfig {
    fn default() -> Self {
        Self {
            vocab_size: 151_936,
            hidden_size: 1536,
            intermediate_size: 8960,
            num_hidden_layers: 28,
            num_attention_heads: 12,
            num_key_value_heads: 2,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
            tie_word_embeddings: true,
            image_token_id: 151_655,
            eos_token_id: 151_645,
            rope_scaling: RopeScaling::default(),
            vision_config: VisionConfig::default(),
        }
    }
}

impl Qwen2VlConfig {
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let bytes = std::fs::read(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ModelError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Multimodal rotary split of the half head dimension into t/h/w sections.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RopeScaling {
    pub mrope_section: Vec<usize>,
}

impl Default for RopeScaling {
    fn default() -> Self {
        Self {
            mrope_section: vec![16, 24, 24],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub depth: usize,
    pub embed_dim: usize,
    pub mlp_ratio: f64,
    pub num_heads: usize,
    #[serde(alias = "in_channels")]
    pub in_chans: usize,
    /// Width of the merged tokens handed to the text decoder.
    pub hidden_size: usize,
    pub patch_size: usize,
    pub spatial_merge_size: usize,
    pub temporal_patch_size: usize,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            depth: 32,
            embed_dim: 1280,
            mlp_ratio: 4.0,
            num_heads: 16,
            in_chans: 3,
            hidden_size: 1536,
            patch_size: 14,
            spatial_merge_size: 2,
            temporal_patch_size: 2,
        }
    }
}

impl VisionConfig {
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    pub fn mlp_dim(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }

    /// Flattened length of one patch: channels, frames and pixels.
    pub fn patch_dim(&self) -> usize {
        self.in_chans * self.temporal_patch_size * self.patch_size * self.patch_size
    }
}
