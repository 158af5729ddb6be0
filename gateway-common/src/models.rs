//! `/v1/models` list types and the OpenAI error envelope.

use serde::{Deserialize, Serialize};

/// Model entry in a `/v1/models` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl ModelObject {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "model".to_string(),
            created: 0,
            owned_by: "gateway".to_string(),
        }
    }
}

/// Response from `/v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelObject>,
}

impl ModelsResponse {
    pub fn from_ids(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            object: "list".to_string(),
            data: ids.into_iter().map(ModelObject::new).collect(),
        }
    }
}

/// OpenAI-style error body: `{"error": {"message", "type", "code"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn new(error_type: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: error_type.to_string(),
                code: Some(code.to_string()),
            },
        }
    }
}
