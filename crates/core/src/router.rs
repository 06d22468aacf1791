//! Maps a requested model name to a `(provider, model)` target, consulting
//! the cooldown manager to route around rate-limited targets (C6).

use std::collections::HashMap;

use crate::cooldown::{cooldown_key, CooldownManager};

#[derive(Debug, Clone)]
pub struct ModelMapping {
    pub provider: String,
    pub model: String,
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTarget<'a> {
    pub provider: &'a str,
    pub model: &'a str,
}

impl<'a> ResolvedTarget<'a> {
    pub fn to_owned(self) -> (String, String) {
        (self.provider.to_string(), self.model.to_string())
    }
}

pub struct RouterConfig {
    pub model_mapping: HashMap<String, ModelMapping>,
    pub default_provider: String,
    pub fallback_order: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            model_mapping: HashMap::new(),
            default_provider: "openai".to_string(),
            fallback_order: Vec::new(),
        }
    }
}

/// By model-name prefix heuristics, used when there's no explicit mapping
/// and no explicit target provider (§4.8 step 3d).
pub fn infer_provider(model: &str) -> &'static str {
    let m = model.to_lowercase();
    if m.starts_with("claude") {
        "anthropic"
    } else if m.starts_with("gemini-claude-") || m.contains("antigravity") {
        "antigravity"
    } else if m.starts_with("gpt-5") || m.contains("codex") {
        "openai-web"
    } else if m.starts_with("gpt-") || m.starts_with("o1") || m.starts_with("o3") || m.starts_with("o4") {
        "openai"
    } else if m.starts_with("gemini") {
        "gemini"
    } else if m.starts_with("glm-")
        || m.starts_with("qwen-")
        || m.starts_with("kimi-")
        || m.starts_with("grok-")
        || m == "big-pickle"
        || m == "glm-4.7-free"
    {
        "opencode-zen"
    } else {
        "openai"
    }
}

pub struct Router {
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// `resolveModel(requested) -> {provider, model}`. Fallback resolution
    /// is non-recursive (one level): a fallback must itself be mapped;
    /// unmapped fallbacks fall through to `infer_provider` rather than
    /// recursing through their own fallback list (documented open-question
    /// resolution, see DESIGN.md).
    pub fn resolve_model(&self, cooldowns: &CooldownManager, requested: &str) -> (String, String) {
        let Some(mapping) = self.config.model_mapping.get(requested) else {
            return (self.config.default_provider.clone(), requested.to_string());
        };

        let primary_key = cooldown_key(&mapping.provider, &mapping.model);
        if cooldowns.is_available(&primary_key) {
            return (mapping.provider.clone(), mapping.model.clone());
        }

        for fallback_model in &mapping.fallbacks {
            if let Some(fallback_mapping) = self.config.model_mapping.get(fallback_model) {
                let key = cooldown_key(&fallback_mapping.provider, &fallback_mapping.model);
                if cooldowns.is_available(&key) {
                    return (fallback_mapping.provider.clone(), fallback_mapping.model.clone());
                }
            } else {
                let provider = infer_provider(fallback_model);
                let key = cooldown_key(provider, fallback_model);
                if cooldowns.is_available(&key) {
                    return (provider.to_string(), fallback_model.clone());
                }
            }
        }

        // all candidates cooled down: return the primary anyway, let the
        // caller fail or retry naturally (§4.5 step 3).
        (mapping.provider.clone(), mapping.model.clone())
    }

    /// Resolves `model` to its cooldown key via `model_mapping` and marks
    /// it rate-limited.
    pub fn handle_rate_limit(&self, cooldowns: &CooldownManager, model: &str, retry_after_ms: Option<u64>) {
        let (provider, mapped_model) = match self.config.model_mapping.get(model) {
            Some(mapping) => (mapping.provider.clone(), mapping.model.clone()),
            None => (infer_provider(model).to_string(), model.to_string()),
        };
        cooldowns.mark_rate_limited(&cooldown_key(&provider, &mapped_model), retry_after_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(provider: &str, model: &str, fallbacks: &[&str]) -> ModelMapping {
        ModelMapping {
            provider: provider.to_string(),
            model: model.to_string(),
            fallbacks: fallbacks.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn unmapped_model_uses_default_provider() {
        let router = Router::new(RouterConfig::default());
        let cooldowns = CooldownManager::new();
        assert_eq!(
            router.resolve_model(&cooldowns, "mystery-model"),
            ("openai".to_string(), "mystery-model".to_string())
        );
    }

    #[test]
    fn falls_back_when_primary_cooled_down() {
        let mut model_mapping = HashMap::new();
        model_mapping.insert("A".to_string(), mapping("provider1", "modelP", &["modelF"]));
        model_mapping.insert("modelF".to_string(), mapping("provider2", "modelF", &[]));
        let router = Router::new(RouterConfig {
            model_mapping,
            ..RouterConfig::default()
        });
        let cooldowns = CooldownManager::new();
        cooldowns.mark_rate_limited("provider1:modelP", None);
        assert_eq!(
            router.resolve_model(&cooldowns, "A"),
            ("provider2".to_string(), "modelF".to_string())
        );
    }

    #[test]
    fn returns_primary_when_all_cooled_down() {
        let mut model_mapping = HashMap::new();
        model_mapping.insert("A".to_string(), mapping("provider1", "modelP", &["modelF"]));
        model_mapping.insert("modelF".to_string(), mapping("provider2", "modelF", &[]));
        let router = Router::new(RouterConfig {
            model_mapping,
            ..RouterConfig::default()
        });
        let cooldowns = CooldownManager::new();
        cooldowns.mark_rate_limited("provider1:modelP", None);
        cooldowns.mark_rate_limited("provider2:modelF", None);
        assert_eq!(
            router.resolve_model(&cooldowns, "A"),
            ("provider1".to_string(), "modelP".to_string())
        );
    }

    #[test]
    fn infer_provider_prefixes() {
        assert_eq!(infer_provider("claude-3-opus"), "anthropic");
        assert_eq!(infer_provider("gpt-4"), "openai");
        assert_eq!(infer_provider("gpt-5-codex"), "openai-web");
        assert_eq!(infer_provider("gemini-pro"), "gemini");
        assert_eq!(infer_provider("glm-4.7-free"), "opencode-zen");
    }
}
