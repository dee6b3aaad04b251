use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: EmbeddingsInput,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingsInput {
    Text(String),
    Many(Vec<String>),
}

impl EmbeddingsInput {
    pub fn flat_text(&self) -> String {
        match self {
            EmbeddingsInput::Text(text) => text.clone(),
            EmbeddingsInput::Many(texts) => texts.join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub object: String,
    pub model: String,
    pub data: Vec<EmbeddingRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<super::chat::CompletionUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRow {
    pub object: String,
    pub index: u32,
    pub embedding: Vec<f32>,
}
