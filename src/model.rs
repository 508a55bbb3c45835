use crate::normalizer::NormalizedImage;

/// Sampling policy applied to every generation.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingParams {
    /// Upper bound on generated tokens.
    pub max_new_tokens: usize,
    /// Softmax temperature used when sampling.
    pub temperature: f64,
    /// Draw from the distribution instead of taking the argmax.
    pub do_sample: bool,
    /// Beam count. Only single-beam decoding is supported.
    pub num_beams: usize,
    /// Fixes the sampling RNG; `None` draws a fresh seed per generation.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 64,
            temperature: 1.0,
            do_sample: true,
            num_beams: 1,
            seed: None,
        }
    }
}

/// A rendered prompt and its image, ready for the backend.
pub struct GenerationRequest {
    pub prompt: String,
    pub image: NormalizedImage,
    pub params: SamplingParams,
}

/// Raw decoded output of a generation.
///
/// `text` still contains the prompt echo and role markers; it is only meant
/// for the answer extractor.
#[derive(Clone, Debug)]
pub struct GenerationResult {
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
}

/// Static description of a loaded backend.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelInfo {
    pub model_id: String,
    pub device: String,
    pub processor_loaded: bool,
}

/// Trait for vision-language backends driven by the [`crate::InferenceEngine`].
///
/// Implementations own their device-resident state; the engine guarantees
/// that `generate` is never called concurrently.
pub trait InferenceModel {
    /// The error type that can be returned during generation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Identity and placement of the loaded model.
    fn info(&self) -> ModelInfo;

    /// Runs bounded generation for one prompt/image pair.
    fn generate(&mut self, request: GenerationRequest) -> Result<GenerationResult, Self::Error>;
}
