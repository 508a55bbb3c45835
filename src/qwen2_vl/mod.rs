//! Qwen2-VL on candle, with a PEFT LoRA adapter merged in at load time.

pub mod config;
pub mod lora;
pub mod processor;
pub mod text;
pub mod vision;
pub mod weights;

use crate::{
    model::{GenerationRequest, GenerationResult, InferenceModel, ModelInfo, SamplingParams},
    prompt::IMAGE_PAD,
};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use config::Qwen2VlConfig;
use lora::LoraAdapter;
use processor::{ImageProcessor, ImageProcessorConfig, ProcessedImage};
use std::path::PathBuf;
use text::TextModel;
use thiserror::Error;
use tokenizers::Tokenizer;
use vision::VisionTransformer;
use weights::CheckpointFiles;

pub const DEFAULT_MODEL_ID: &str = "Qwen/Qwen2-VL-2B-Instruct";

const END_OF_TEXT: &str = "<|endoftext|>";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Config {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("hub download failed: {0}")]
    Hub(String),
    #[error("missing weights: {0}")]
    MissingWeight(String),
    #[error("adapter error: {0}")]
    Adapter(String),
    #[error("invalid model input: {0}")]
    Input(String),
    #[error("unsupported generation setting: {0}")]
    Unsupported(String),
}

/// Where to find the base checkpoint and the adapter.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub model_id: String,
    /// Local checkpoint directory; the hub is used when absent.
    pub model_dir: Option<PathBuf>,
    pub adapter_dir: PathBuf,
    pub force_cpu: bool,
}

/// CUDA, then Metal, then CPU.
pub fn select_device(force_cpu: bool) -> Result<Device, ModelError> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

pub fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

pub struct Qwen2VlModel {
    model_id: String,
    tokenizer: Tokenizer,
    processor: ImageProcessor,
    backbone: Backbone,
}

impl Qwen2VlModel {
    /// Resolves the checkpoint, merges the adapter and builds the model on
    /// the selected device. Any failure is fatal for the caller.
    pub fn load(options: &LoadOptions) -> Result<Self, ModelError> {
        let files = CheckpointFiles::resolve(&options.model_id, options.model_dir.as_deref())?;
        let config = Qwen2VlConfig::from_file(&files.config)?;
        let processor_config = match &files.preprocessor {
            Some(path) => ImageProcessorConfig::from_file(path)?,
            None => ImageProcessorConfig::default(),
        };
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|err| ModelError::Tokenizer(err.to_string()))?;

        let device = select_device(options.force_cpu)?;
        let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };
        log::info!("Using device {} with {dtype:?}", device_label(&device));

        let mut tensors = weights::load_tensors(&files.weights, &device)?;
        log::info!("Loaded {} base tensors", tensors.len());

        let adapter = LoraAdapter::load(&options.adapter_dir, &device)?;
        let merged = adapter.merge_into(&mut tensors)?;
        log::info!("Merged LoRA adapter into {merged} modules");

        let mut eos_token_ids = vec![config.eos_token_id];
        eos_token_ids.extend(tokenizer.token_to_id(END_OF_TEXT));
        eos_token_ids.dedup();

        let vb = VarBuilder::from_tensors(tensors, dtype, &device);
        let backbone = Backbone::load(config, vb, eos_token_ids)?;

        Ok(Self {
            model_id: options.model_id.clone(),
            tokenizer,
            processor: ImageProcessor::new(processor_config),
            backbone,
        })
    }

    /// Tokenizes `prompt` with its single image placeholder expanded to
    /// `image_tokens` pad tokens.
    fn encode_prompt(&self, prompt: &str, image_tokens: usize) -> Result<Vec<u32>, ModelError> {
        if prompt.matches(IMAGE_PAD).count() != 1 {
            return Err(ModelError::Input(
                "prompt must contain exactly one image placeholder".into(),
            ));
        }
        let expanded = prompt.replacen(IMAGE_PAD, &IMAGE_PAD.repeat(image_tokens), 1);
        let encoding = self
            .tokenizer
            .encode(expanded, false)
            .map_err(|err| ModelError::Tokenizer(err.to_string()))?;
        let ids = encoding.get_ids().to_vec();

        let image_token_id = self.backbone.config.image_token_id;
        let pads = ids.iter().filter(|&&id| id == image_token_id).count();
        if pads != image_tokens {
            return Err(ModelError::Input(format!(
                "prompt encodes {pads} image tokens, image needs {image_tokens}"
            )));
        }
        Ok(ids)
    }
}

impl InferenceModel for Qwen2VlModel {
    type Error = ModelError;

    fn info(&self) -> ModelInfo {
        ModelInfo {
            model_id: self.model_id.clone(),
            device: device_label(&self.backbone.device).to_string(),
            processor_loaded: true,
        }
    }

    fn generate(&mut self, request: GenerationRequest) -> Result<GenerationResult, Self::Error> {
        let merge = self.backbone.config.vision_config.spatial_merge_size;
        let processed = self
            .processor
            .process(request.image.as_rgb(), &self.backbone.device)?;
        let ids = self.encode_prompt(&request.prompt, processed.token_count(merge))?;
        log::debug!(
            "Prompt has {} tokens, image grid {:?}",
            ids.len(),
            processed.grid_thw
        );

        let generated = self.backbone.generate_ids(&ids, &processed, &request.params)?;

        let all_ids: Vec<u32> = ids.iter().chain(&generated).copied().collect();
        let text = self
            .tokenizer
            .decode(&all_ids, true)
            .map_err(|err| ModelError::Tokenizer(err.to_string()))?;

        Ok(GenerationResult {
            text,
            prompt_tokens: ids.len(),
            generated_tokens: generated.len(),
        })
    }
}

/// Both towers on one device, working purely on token ids and pixels.
struct Backbone {
    config: Qwen2VlConfig,
    vision: VisionTransformer,
    text: TextModel,
    eos_token_ids: Vec<u32>,
    device: Device,
}

impl Backbone {
    fn load(
        config: Qwen2VlConfig,
        vb: VarBuilder,
        eos_token_ids: Vec<u32>,
    ) -> Result<Self, ModelError> {
        let vision = VisionTransformer::load(&config.vision_config, vb.pp("visual"))?;
        let text = TextModel::load(&config, vb.clone())?;
        Ok(Self {
            config,
            vision,
            text,
            eos_token_ids,
            device: vb.device().clone(),
        })
    }

    /// Text embeddings with the image token run replaced by the vision output.
    fn embed_prompt(&self, ids: &[u32], image_embeds: &Tensor) -> Result<Tensor, ModelError> {
        let input = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
        let embeds = self.text.embed(&input)?;

        let Some(start) = ids.iter().position(|&id| id == self.config.image_token_id) else {
            return Ok(embeds);
        };
        let len = image_embeds.dim(0)?;
        let image_embeds = image_embeds.to_dtype(embeds.dtype())?.unsqueeze(0)?;
        let tail = ids
            .len()
            .checked_sub(start + len)
            .ok_or_else(|| ModelError::Input(format!("{len} image embeddings overflow the prompt")))?;
        Ok(Tensor::cat(
            &[
                embeds.narrow(1, 0, start)?,
                image_embeds,
                embeds.narrow(1, start + len, tail)?,
            ],
            1,
        )?)
    }

    /// Prefills the prompt and samples until an EOS id or `max_new_tokens`.
    /// The returned ids include the EOS token when one was produced.
    fn generate_ids(
        &mut self,
        ids: &[u32],
        image: &ProcessedImage,
        params: &SamplingParams,
    ) -> Result<Vec<u32>, ModelError> {
        if params.num_beams != 1 {
            return Err(ModelError::Unsupported(format!(
                "num_beams={} (only single-beam decoding)",
                params.num_beams
            )));
        }

        let image_embeds = self.vision.forward(&image.pixel_values, image.grid_thw)?;
        let embeds = self.embed_prompt(ids, &image_embeds)?;
        let (positions, mut next_position) = text::mrope_positions(
            ids,
            self.config.image_token_id,
            image.grid_thw,
            self.config.vision_config.spatial_merge_size,
        );

        let sampling = if params.do_sample {
            Sampling::All {
                temperature: params.temperature,
            }
        } else {
            Sampling::ArgMax
        };
        let seed = params.seed.unwrap_or_else(rand::random);
        let mut logits_processor = LogitsProcessor::from_sampling(seed, sampling);

        self.text.clear_kv_cache();
        let mut logits = self.text.forward(&embeds, &positions)?;
        let mut generated = Vec::with_capacity(params.max_new_tokens);
        while generated.len() < params.max_new_tokens {
            let token = logits_processor.sample(&logits)?;
            generated.push(token);
            if self.eos_token_ids.contains(&token) || generated.len() == params.max_new_tokens {
                break;
            }
            let input = Tensor::new(&[token], &self.device)?.unsqueeze(0)?;
            let embeds = self.text.embed(&input)?;
            logits = self.text.forward(&embeds, &[[next_position; 3]])?;
            next_position += 1;
        }
        self.text.clear_kv_cache();
        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Init, VarMap};
    use config::{RopeScaling, VisionConfig};
    use image::{Rgb, RgbImage};

    const IMAGE_TOKEN: u32 = 60;
    const VOCAB: usize = 64;

    fn tiny_config() -> Qwen2VlConfig {
        Qwen2VlConfig {
            vocab_size: VOCAB,
            hidden_size: 32,
            intermediate_size: 64,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            image_token_id: IMAGE_TOKEN,
            eos_token_id: 63,
            rope_scaling: RopeScaling {
                mrope_section: vec![1, 1, 2],
            },
            vision_config: VisionConfig {
                depth: 2,
                embed_dim: 16,
                mlp_ratio: 2.0,
                num_heads: 2,
                hidden_size: 32,
                ..VisionConfig::default()
            },
            ..Qwen2VlConfig::default()
        }
    }

    // random weights; the patch embedding would otherwise start at zero
    fn tiny_backbone(eos_token_ids: Vec<u32>) -> Backbone {
        let varmap = VarMap::new();
        varmap
            .get(
                (16, 3, 2, 14, 14),
                "visual.patch_embed.proj.weight",
                Init::Randn {
                    mean: 0.0,
                    stdev: 0.02,
                },
                DType::F32,
                &Device::Cpu,
            )
            .unwrap();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Backbone::load(tiny_config(), vb, eos_token_ids).unwrap()
    }

    fn chart() -> ProcessedImage {
        let image = RgbImage::from_fn(100, 60, |x, y| Rgb([(x * 2) as u8, (y * 4) as u8, 128]));
        ImageProcessor::default().process(&image, &Device::Cpu).unwrap()
    }

    fn prompt_ids(image: &ProcessedImage) -> Vec<u32> {
        let mut ids = vec![1, 2, 3];
        ids.extend(std::iter::repeat_n(IMAGE_TOKEN, image.token_count(2)));
        ids.extend([4, 5]);
        ids
    }

    fn greedy(max_new_tokens: usize) -> SamplingParams {
        SamplingParams {
            max_new_tokens,
            do_sample: false,
            seed: Some(7),
            ..SamplingParams::default()
        }
    }

    #[test]
    fn towers_produce_expected_shapes() {
        let mut backbone = tiny_backbone(vec![]);
        let image = chart();
        assert_eq!(image.grid_thw, [1, 4, 8]);
        assert_eq!(image.token_count(2), 8);

        let image_embeds = backbone
            .vision
            .forward(&image.pixel_values, image.grid_thw)
            .unwrap();
        assert_eq!(image_embeds.dims(), &[8, 32]);

        let ids = prompt_ids(&image);
        let embeds = backbone.embed_prompt(&ids, &image_embeds).unwrap();
        assert_eq!(embeds.dims(), &[1, ids.len(), 32]);
        // the spliced rows are the vision output
        let spliced = embeds.squeeze(0).unwrap().narrow(0, 3, 8).unwrap();
        let diff = (spliced - &image_embeds).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);

        let (positions, _) = text::mrope_positions(&ids, IMAGE_TOKEN, image.grid_thw, 2);
        let logits = backbone.text.forward(&embeds, &positions).unwrap();
        assert_eq!(logits.dims(), &[VOCAB]);
        assert_eq!(logits.dtype(), DType::F32);
    }

    #[test]
    fn generation_stops_at_max_new_tokens() {
        let mut backbone = tiny_backbone(vec![]);
        let image = chart();
        let generated = backbone
            .generate_ids(&prompt_ids(&image), &image, &greedy(5))
            .unwrap();
        assert_eq!(generated.len(), 5);
        assert!(generated.iter().all(|&id| (id as usize) < VOCAB));

        let sampled = backbone
            .generate_ids(&prompt_ids(&image), &image, &SamplingParams::default())
            .unwrap();
        assert_eq!(sampled.len(), 64);
    }

    #[test]
    fn greedy_generation_is_repeatable() {
        let mut backbone = tiny_backbone(vec![]);
        let image = chart();
        let ids = prompt_ids(&image);
        let first = backbone.generate_ids(&ids, &image, &greedy(4)).unwrap();
        let second = backbone.generate_ids(&ids, &image, &greedy(4)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn generation_stops_at_eos() {
        let mut backbone = tiny_backbone(vec![]);
        let image = chart();
        let ids = prompt_ids(&image);
        let first = backbone.generate_ids(&ids, &image, &greedy(1)).unwrap();
        assert_eq!(first.len(), 1);

        // make the first greedy token an end-of-sequence id
        backbone.eos_token_ids = first.clone();
        let generated = backbone.generate_ids(&ids, &image, &greedy(10)).unwrap();
        assert_eq!(generated, first);
    }

    #[test]
    fn zero_budget_generates_nothing() {
        let mut backbone = tiny_backbone(vec![]);
        let image = chart();
        let generated = backbone
            .generate_ids(&prompt_ids(&image), &image, &greedy(0))
            .unwrap();
        assert!(generated.is_empty());
    }

    #[test]
    fn beam_search_is_rejected() {
        let mut backbone = tiny_backbone(vec![]);
        let image = chart();
        let params = SamplingParams {
            num_beams: 2,
            ..SamplingParams::default()
        };
        let err = backbone
            .generate_ids(&prompt_ids(&image), &image, &params)
            .unwrap_err();
        assert!(matches!(err, ModelError::Unsupported(_)));
    }

    #[test]
    fn output_head_follows_tie_setting() {
        for tied in [true, false] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let config = Qwen2VlConfig {
                tie_word_embeddings: tied,
                ..tiny_config()
            };
            TextModel::load(&config, vb).unwrap();
            let has_head = varmap.data().lock().unwrap().contains_key("lm_head.weight");
            assert_eq!(has_head, !tied);
        }
    }
}
