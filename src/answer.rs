use crate::prompt::{IM_START, Role};

/// Outcome of stripping the prompt echo from decoded output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Extraction {
    /// Text found after the last assistant role marker.
    Answer(String),
    /// No role marker was present; the whole decoded text, trimmed.
    Fallback(String),
}

impl Extraction {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Extraction::Fallback(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Extraction::Answer(text) | Extraction::Fallback(text) => text,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Extraction::Answer(text) | Extraction::Fallback(text) => text,
        }
    }
}

/// Returns the text following the last assistant role marker in `raw`.
///
/// Markers that open a line (or directly follow `<|im_start|>`) win over bare
/// occurrences of the word, so an answer that mentions "assistant" inside a
/// sentence is not cut. Without any marker the trimmed input is returned as
/// [`Extraction::Fallback`].
pub fn extract_answer(raw: &str) -> Extraction {
    let marker = Role::Assistant.as_str();
    let anchored = raw.rmatch_indices(marker).map(|(idx, _)| idx).find(|&idx| {
        let before = &raw[..idx];
        before.is_empty() || before.ends_with('\n') || before.ends_with(IM_START)
    });

    match anchored.or_else(|| raw.rfind(marker)) {
        Some(idx) => Extraction::Answer(raw[idx + marker.len()..].trim().to_string()),
        None => Extraction::Fallback(raw.trim().to_string()),
    }
}
