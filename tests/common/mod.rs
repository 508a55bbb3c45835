#![allow(dead_code)]

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chartqa_infernum::{
    ChartQaService, GenerationRequest, GenerationResult, InferenceModel, ModelInfo, ServiceConfig,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::{
    io::Cursor,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

pub const MODEL_ID: &str = "fake/chart-model";

/// What the fake backend does when asked to generate.
#[derive(Clone, Debug)]
pub enum Behavior {
    /// Decoded text echoing the prompt, followed by this answer.
    Answer(String),
    /// Exactly this decoded text.
    Raw(String),
    Fail(String),
    Panic,
}

/// Observations shared between a test and its fake backend.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<(String, (u32, u32))>>>,
}

impl Recorder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Prompt and image dimensions of every generation, in order.
    pub fn requests(&self) -> Vec<(String, (u32, u32))> {
        self.requests.lock().unwrap().clone()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FakeError(String);

pub struct FakeModel {
    behavior: Behavior,
    delay: Duration,
    recorder: Recorder,
}

impl FakeModel {
    pub fn new(behavior: Behavior) -> (Self, Recorder) {
        let recorder = Recorder::default();
        let model = Self {
            behavior,
            delay: Duration::ZERO,
            recorder: recorder.clone(),
        };
        (model, recorder)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl InferenceModel for FakeModel {
    type Error = FakeError;

    fn info(&self) -> ModelInfo {
        ModelInfo {
            model_id: MODEL_ID.to_string(),
            device: "cpu".to_string(),
            processor_loaded: true,
        }
    }

    fn generate(&mut self, request: GenerationRequest) -> Result<GenerationResult, Self::Error> {
        self.recorder.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.max_active.fetch_max(active, Ordering::SeqCst);
        self.recorder
            .requests
            .lock()
            .unwrap()
            .push((request.prompt.clone(), request.image.dimensions()));

        std::thread::sleep(self.delay);
        self.recorder.active.fetch_sub(1, Ordering::SeqCst);

        let text = match &self.behavior {
            Behavior::Answer(answer) => format!(
                "system\nYou are a helpful assistant.\nuser\n{}\nassistant\n{answer}",
                request.prompt
            ),
            Behavior::Raw(text) => text.clone(),
            Behavior::Fail(message) => return Err(FakeError(message.clone())),
            Behavior::Panic => panic!("simulated device crash"),
        };
        Ok(GenerationResult {
            text,
            prompt_tokens: 10,
            generated_tokens: 5,
        })
    }
}

pub fn service(model: FakeModel, config: &ServiceConfig) -> Arc<ChartQaService> {
    Arc::new(ChartQaService::new(model, config))
}

/// A striped chart-like PNG, base64-encoded.
pub fn png_base64(width: u32, height: u32) -> String {
    let image = RgbImage::from_fn(width, height, |x, y| {
        if (x / 50) % 2 == 0 && y > height / 3 {
            Rgb([30, 90, 200])
        } else {
            Rgb([255, 255, 255])
        }
    });
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut bytes, ImageFormat::Png)
        .unwrap();
    STANDARD.encode(bytes.into_inner())
}
