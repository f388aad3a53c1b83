//! Model registry: the ordered menu of selectable models and their routes

use sova_config::ModelConfig;
use sova_storage::{ChatBackend, ImageEngine, ModelSelection, Route};

pub const IMAGE_GENERATION_PREFIX: &str = "image-gen:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub label: String,
    pub id: String,
    pub route: Route,
    pub vision: bool,
}

impl ModelEntry {
    pub fn new(label: &str, id: &str, vision: bool) -> Self {
        Self {
            label: label.to_string(),
            id: id.to_string(),
            route: resolve_route(id),
            vision,
        }
    }

    pub fn selection(&self) -> ModelSelection {
        ModelSelection {
            id: self.id.clone(),
            route: self.route.clone(),
        }
    }
}

/// Route of a model identifier, from its shape alone.
pub fn resolve_route(id: &str) -> Route {
    if let Some(engine) = id.strip_prefix(IMAGE_GENERATION_PREFIX) {
        Route::ImageGeneration(ImageEngine(engine.to_string()))
    } else if id.contains('/') {
        Route::Chat(ChatBackend::Gateway)
    } else {
        Route::Chat(ChatBackend::Primary)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    entries: Vec<ModelEntry>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        Self {
            entries: vec![
                ModelEntry::new("🚀 Small (fast)", "mistral-small-latest", false),
                ModelEntry::new("🧠 Large (smart)", "mistral-large-latest", false),
                ModelEntry::new("💻 Codestral (code)", "codestral-latest", false),
                ModelEntry::new(
                    "✨ Gemini 2.0 Flash Experimental",
                    "google/gemini-2.0-flash-exp:free",
                    true,
                ),
                ModelEntry::new("🎨 Flux (best)", "image-gen:flux", false),
                ModelEntry::new("🖼️ SDXL (stylish)", "image-gen:turbo", false),
                ModelEntry::new(
                    "🐋 DeepSeek R1 (Chimera)",
                    "tngtech/deepseek-r1t2-chimera:free",
                    false,
                ),
            ],
        }
    }

    pub fn from_entries(entries: Vec<ModelEntry>) -> Self {
        Self { entries }
    }

    /// Configured `[[models]]` table, or the built-in one when it is empty.
    pub fn from_config(models: &[ModelConfig]) -> Self {
        if models.is_empty() {
            return Self::builtin();
        }
        Self {
            entries: models
                .iter()
                .map(|m| ModelEntry::new(m.label.trim(), m.id.trim(), m.vision))
                .collect(),
        }
    }

    /// Registry for a configuration, with gateway models hidden when the
    /// gateway has no usable credential.
    pub fn for_config(config: &sova_config::Config) -> Self {
        let mut registry = Self::from_config(&config.models);
        if config.usable_gateway().is_none() {
            let removed = registry.without_gateway();
            if removed > 0 {
                tracing::warn!(
                    "Gateway credential missing or placeholder; hiding {} gateway model(s)",
                    removed
                );
            }
        }
        registry
    }

    /// Drop every gateway-routed entry, returning how many were removed.
    pub fn without_gateway(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.route != Route::Chat(ChatBackend::Gateway));
        before - self.entries.len()
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn label_for(&self, id: &str) -> Option<&str> {
        self.get(id).map(|entry| entry.label.as_str())
    }

    /// Selection for a registered id; unregistered ids fall through to
    /// the primary chat backend under their own name.
    pub fn resolve_or_primary(&self, id: &str) -> ModelSelection {
        match self.get(id) {
            Some(entry) => entry.selection(),
            None => ModelSelection {
                id: id.to_string(),
                route: Route::Chat(ChatBackend::Primary),
            },
        }
    }

    /// Whether a model accepts image input. Unregistered ids are judged by name.
    pub fn supports_vision(&self, id: &str) -> bool {
        match self.get(id) {
            Some(entry) => entry.vision,
            None => {
                let lower = id.to_lowercase();
                lower.contains("vision") || lower.contains("gemini") || lower.contains("-vl")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_resolution_by_shape() {
        assert_eq!(
            resolve_route("image-gen:flux"),
            Route::ImageGeneration(ImageEngine("flux".to_string()))
        );
        assert_eq!(
            resolve_route("google/gemini-2.0-flash-exp:free"),
            Route::Chat(ChatBackend::Gateway)
        );
        assert_eq!(
            resolve_route("mistral-small-latest"),
            Route::Chat(ChatBackend::Primary)
        );
    }

    #[test]
    fn builtin_registry_keeps_menu_order() {
        let registry = ModelRegistry::builtin();
        let ids: Vec<&str> = registry.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids.len(), 7);
        assert_eq!(ids[0], "mistral-small-latest");
        assert_eq!(ids[6], "tngtech/deepseek-r1t2-chimera:free");
    }

    #[test]
    fn gateway_degradation_removes_every_slash_identifier() {
        let mut registry = ModelRegistry::builtin();
        let removed = registry.without_gateway();
        assert_eq!(removed, 2);
        assert!(registry.entries().iter().all(|e| !e.id.contains('/')));
        assert!(registry.contains("image-gen:flux"));
        assert!(registry.contains("codestral-latest"));
    }

    #[test]
    fn for_config_degrades_without_usable_gateway() {
        let mut config = sova_config::Config::default();
        assert_eq!(ModelRegistry::for_config(&config).entries().len(), 5);

        config.providers.gateway = Some(sova_config::ProviderConfig {
            name: "openrouter".to_string(),
            api_key: "sk-or-real".to_string(),
            base_url: None,
        });
        assert_eq!(ModelRegistry::for_config(&config).entries().len(), 7);
    }

    #[test]
    fn unregistered_id_resolves_to_primary() {
        let registry = ModelRegistry::builtin();
        let selection = registry.resolve_or_primary("retired-model");
        assert_eq!(selection.id, "retired-model");
        assert_eq!(selection.route, Route::Chat(ChatBackend::Primary));
        assert_eq!(registry.label_for("retired-model"), None);
    }

    #[test]
    fn vision_flag_and_name_heuristic() {
        let registry = ModelRegistry::builtin();
        assert!(registry.supports_vision("google/gemini-2.0-flash-exp:free"));
        assert!(!registry.supports_vision("mistral-small-latest"));
        assert!(registry.supports_vision("qwen/qwen2.5-vl-72b"));
    }

    #[test]
    fn configured_models_override_builtin() {
        let models = vec![ModelConfig {
            label: "Only".to_string(),
            id: "image-gen:flux".to_string(),
            vision: false,
        }];
        let registry = ModelRegistry::from_config(&models);
        assert_eq!(registry.entries().len(), 1);
        assert_eq!(registry.label_for("image-gen:flux"), Some("Only"));
    }
}
