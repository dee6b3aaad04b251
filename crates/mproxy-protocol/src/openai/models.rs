use serde::{Deserialize, Serialize};

/// `GET /v1/models` — OpenAI list shape used as the lingua franca of the
/// front door's model listing regardless of target service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

impl ModelList {
    pub fn new(ids: Vec<String>, owned_by: &str, created: i64) -> Self {
        Self {
            object: "list".to_string(),
            data: ids
                .into_iter()
                .map(|id| ModelEntry {
                    id,
                    object: "model".to_string(),
                    created,
                    owned_by: owned_by.to_string(),
                })
                .collect(),
        }
    }
}
