use thiserror::Error;

/// Request-scoped failures produced by the analysis pipeline.
///
/// Every stage returns one of these; the service layer decides how it is
/// logged and which status it maps to through [`ChartQaError::kind`].
#[derive(Debug, Error)]
pub enum ChartQaError {
    /// A required request field is missing or empty.
    #[error("{0}")]
    Validation(String),
    /// The image payload is not valid base64 or not a decodable raster image.
    #[error("failed to decode image: {0}")]
    Decode(String),
    /// The assembled conversation is malformed.
    #[error("invalid conversation: {0}")]
    Template(String),
    /// The backend failed while generating (device error, out of memory, timeout).
    #[error("generation failed: {0}")]
    Generation(String),
    /// The inference worker is not available.
    #[error("model not ready: {0}")]
    ModelNotReady(String),
}

/// Plain tag for a [`ChartQaError`], used by transports to pick a response status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Decode,
    Template,
    Generation,
    ModelNotReady,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Decode => "decode_error",
            ErrorKind::Template => "template_error",
            ErrorKind::Generation => "generation_error",
            ErrorKind::ModelNotReady => "model_not_ready",
        }
    }

    /// Whether the failure was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, ErrorKind::Validation | ErrorKind::Decode)
    }
}

impl ChartQaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChartQaError::Validation(_) => ErrorKind::Validation,
            ChartQaError::Decode(_) => ErrorKind::Decode,
            ChartQaError::Template(_) => ErrorKind::Template,
            ChartQaError::Generation(_) => ErrorKind::Generation,
            ChartQaError::ModelNotReady(_) => ErrorKind::ModelNotReady,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_is_not_decorated() {
        let err = ChartQaError::Validation("No image data provided".to_string());
        assert_eq!(err.to_string(), "No image data provided");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn only_input_errors_are_client_errors() {
        assert!(ErrorKind::Validation.is_client_error());
        assert!(ErrorKind::Decode.is_client_error());
        assert!(!ErrorKind::Template.is_client_error());
        assert!(!ErrorKind::Generation.is_client_error());
        assert!(!ErrorKind::ModelNotReady.is_client_error());
    }
}
