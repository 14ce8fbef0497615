use kbgate_contracts::{ModelEntry, ModelsResponse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub upstream_model_id: String,
    pub created: i64,
    pub owned_by: String,
}

impl ModelConfig {
    pub fn new(id: &str, upstream_model_id: &str, created: i64, owned_by: &str) -> Self {
        Self {
            id: id.to_string(),
            upstream_model_id: upstream_model_id.to_string(),
            created,
            owned_by: owned_by.to_string(),
        }
    }
}

/// Read-only model table. Unknown ids resolve to the fallback entry.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: Vec<ModelConfig>,
    fallback: ModelConfig,
}

impl ModelCatalog {
    pub fn new(entries: Vec<ModelConfig>, fallback: ModelConfig) -> Self {
        Self { entries, fallback }
    }

    pub fn entries(&self) -> &[ModelConfig] {
        &self.entries
    }

    pub fn resolve(&self, id: &str) -> &ModelConfig {
        self.entries.iter().find(|entry| entry.id == id).unwrap_or(&self.fallback)
    }

    pub fn to_models_response(&self) -> ModelsResponse {
        let data = self
            .entries
            .iter()
            .map(|entry| ModelEntry {
                id: entry.id.clone(),
                object: "model".to_string(),
                created: entry.created,
                owned_by: entry.owned_by.clone(),
            })
            .collect();
        ModelsResponse { object: "list".to_string(), data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ModelCatalog {
        let doubao = ModelConfig::new("doubao", "2", 1_687_882_411, "ulearning");
        ModelCatalog::new(
            vec![ModelConfig::new("qwen", "1", 1_677_610_602, "ulearning"), doubao.clone()],
            doubao,
        )
    }

    #[test]
    fn resolve_finds_known_model() {
        assert_eq!(catalog().resolve("qwen").upstream_model_id, "1");
    }

    #[test]
    fn resolve_falls_back_for_unknown_model() {
        let catalog = catalog();
        assert_eq!(catalog.resolve("gpt-4o").id, "doubao");
        assert_eq!(catalog.resolve("").upstream_model_id, "2");
    }

    #[test]
    fn models_response_lists_every_entry() {
        let response = catalog().to_models_response();
        assert_eq!(response.object, "list");
        assert_eq!(response.data.len(), 2);
        assert_eq!(response.data[0].object, "model");
        assert_eq!(response.data[1].owned_by, "ulearning");
    }
}
