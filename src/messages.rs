use serde::{Deserialize, Serialize};

/// Body of `POST /analyze`.
///
/// Both fields are optional on the wire so that a missing field is reported
/// as a validation failure instead of a JSON rejection.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AnalyzeRequest {
    /// Base64 image bytes, optionally as a `data:` URL.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AnalyzeResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalyzeResponse {
    pub fn success(answer: String, question: String) -> Self {
        Self {
            success: true,
            answer: Some(answer),
            question: Some(question),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            answer: None,
            question: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StatusResponse {
    pub model_loaded: bool,
    pub processor_loaded: bool,
    pub device: String,
    pub model_id: Option<String>,
    pub engine_state: String,
}
