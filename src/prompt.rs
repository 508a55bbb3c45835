//! Conversation model and the Qwen2-VL chat template.

use crate::{error::ChartQaError, normalizer::NormalizedImage};

/// Instruction placed before the image in every user turn.
pub const SYSTEM_INSTRUCTION: &str = "You are a helpful assistant who can analyze the given images in detail and answer the question appropriately.";

/// System turn the chat template inserts when a conversation does not open with one.
pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful assistant.";

pub const IM_START: &str = "<|im_start|>";
pub const IM_END: &str = "<|im_end|>";
pub const VISION_START: &str = "<|vision_start|>";
pub const IMAGE_PAD: &str = "<|image_pad|>";
pub const VISION_END: &str = "<|vision_end|>";

/// Special-token strings the tokenizer would treat as control tokens if they
/// appeared inside user text.
pub const RESERVED_MARKERS: [&str; 8] = [
    IM_START,
    IM_END,
    VISION_START,
    IMAGE_PAD,
    VISION_END,
    "<|vision_pad|>",
    "<|video_pad|>",
    "<|endoftext|>",
];

/// First reserved marker found in `text`, if any.
pub fn find_reserved_marker(text: &str) -> Option<&'static str> {
    RESERVED_MARKERS.into_iter().find(|marker| text.contains(marker))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ContentPart {
    Text(String),
    /// Placeholder for the image; pixels travel separately to the backend.
    Image { width: u32, height: u32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: Role, content: Vec<ContentPart>) {
        self.turns.push(Turn { role, content });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Checks the shape required for generation: a single user turn holding
    /// one image and non-empty text, with the assistant turn left to the model.
    pub fn validate(&self) -> Result<(), ChartQaError> {
        let Some(first) = self.turns.first() else {
            return Err(ChartQaError::Template("conversation has no turns".into()));
        };
        if first.role != Role::User {
            return Err(ChartQaError::Template(format!(
                "conversation must open with a user turn, found `{}`",
                first.role.as_str()
            )));
        }
        if self.turns.len() > 1 {
            return Err(ChartQaError::Template(format!(
                "expected a single user turn, found {} turns",
                self.turns.len()
            )));
        }

        let mut images = 0usize;
        let mut texts = 0usize;
        for (idx, part) in first.content.iter().enumerate() {
            match part {
                ContentPart::Text(text) if text.trim().is_empty() => {
                    return Err(ChartQaError::Template(format!(
                        "text part {idx} of the user turn is empty"
                    )));
                }
                ContentPart::Text(text) => {
                    if let Some(marker) = find_reserved_marker(text) {
                        return Err(ChartQaError::Template(format!(
                            "text part {idx} of the user turn contains reserved marker `{marker}`"
                        )));
                    }
                    texts += 1;
                }
                ContentPart::Image { width, height } if *width == 0 || *height == 0 => {
                    return Err(ChartQaError::Template(format!(
                        "image part {idx} has empty dimensions {width}x{height}"
                    )));
                }
                ContentPart::Image { .. } => images += 1,
            }
        }
        if images != 1 {
            return Err(ChartQaError::Template(format!(
                "user turn must carry exactly one image, found {images}"
            )));
        }
        if texts == 0 {
            return Err(ChartQaError::Template("user turn has no text".into()));
        }
        Ok(())
    }

    /// Renders the conversation with the generation prompt appended, leaving
    /// the assistant turn open.
    pub fn render(&self) -> Result<String, ChartQaError> {
        self.validate()?;

        let mut prompt = String::new();
        push_turn_header(&mut prompt, "system");
        prompt.push_str(DEFAULT_SYSTEM_MESSAGE);
        push_turn_footer(&mut prompt);

        for turn in &self.turns {
            push_turn_header(&mut prompt, turn.role.as_str());
            for part in &turn.content {
                match part {
                    ContentPart::Text(text) => prompt.push_str(text),
                    ContentPart::Image { .. } => {
                        prompt.push_str(VISION_START);
                        prompt.push_str(IMAGE_PAD);
                        prompt.push_str(VISION_END);
                    }
                }
            }
            push_turn_footer(&mut prompt);
        }

        push_turn_header(&mut prompt, Role::Assistant.as_str());
        Ok(prompt)
    }
}

fn push_turn_header(buffer: &mut String, role: &str) {
    buffer.push_str(IM_START);
    buffer.push_str(role);
    buffer.push('\n');
}

fn push_turn_footer(buffer: &mut String) {
    buffer.push_str(IM_END);
    buffer.push('\n');
}

/// Builds the single-turn chart question conversation and renders it.
#[derive(Clone, Debug)]
pub struct PromptAssembler {
    system_instruction: String,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new(SYSTEM_INSTRUCTION)
    }
}

impl PromptAssembler {
    pub fn new(system_instruction: impl Into<String>) -> Self {
        Self {
            system_instruction: system_instruction.into(),
        }
    }

    /// Instruction text, image, question; all in one user turn.
    pub fn build(&self, image: &NormalizedImage, question: &str) -> Conversation {
        let (width, height) = image.dimensions();
        let mut conversation = Conversation::new();
        conversation.push(
            Role::User,
            vec![
                ContentPart::Text(self.system_instruction.clone()),
                ContentPart::Image { width, height },
                ContentPart::Text(question.to_string()),
            ],
        );
        conversation
    }

    pub fn assemble(&self, image: &NormalizedImage, question: &str) -> Result<String, ChartQaError> {
        self.build(image, question).render()
    }
}
