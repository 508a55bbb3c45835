//! Chart question answering served from a single vision-language model.
//!
//! A request flows through the [`ImageNormalizer`], the [`PromptAssembler`],
//! the [`InferenceEngine`] and finally [`extract_answer`]; the
//! [`ChartQaService`] ties the stages together and [`server::router`] exposes
//! it over HTTP.

pub mod answer;
pub mod config;
pub mod engine;
pub mod error;
pub mod messages;
pub mod model;
pub mod normalizer;
pub mod prompt;
pub mod qwen2_vl;
pub mod server;
pub mod service;

pub use answer::{Extraction, extract_answer};
pub use config::ServiceConfig;
pub use engine::{EngineState, InferenceEngine};
pub use error::{ChartQaError, ErrorKind};
pub use model::{GenerationRequest, GenerationResult, InferenceModel, ModelInfo, SamplingParams};
pub use normalizer::{ImageNormalizer, NormalizedImage};
pub use prompt::{Conversation, PromptAssembler};
pub use service::ChartQaService;
