//! TOML configuration file (§6 "Configuration"), grounded on the
//! ancestor's `PluginConfig::from_path` idiom: a plain `Deserialize`
//! struct loaded with `toml::from_str`, no dynamic reload.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use proxy_core::credentials::Credential;
use proxy_core::dispatch::EndpointConfig;
use proxy_core::router::{ModelMapping, RouterConfig};
use proxy_core::signature_cache::SignatureCacheConfig;

#[derive(Debug, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub model_mappings: Vec<ModelMappingEntry>,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub signature_cache: SignatureCacheSection,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSection>,
}

#[derive(Debug, Deserialize)]
pub struct ModelMappingEntry {
    pub from: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SignatureCacheSection {
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries_per_session: usize,
    /// `memory` or `durable`; `durable` requires the `durable-signatures`
    /// feature on `proxy-core` and a `database_url`.
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

fn default_ttl_ms() -> u64 {
    3_600_000
}

fn default_max_entries() -> usize {
    100
}

fn default_storage() -> String {
    "memory".to_string()
}

impl Default for SignatureCacheSection {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            max_entries_per_session: default_max_entries(),
            storage: default_storage(),
            database_url: None,
        }
    }
}

impl From<&SignatureCacheSection> for SignatureCacheConfig {
    fn from(section: &SignatureCacheSection) -> Self {
        Self {
            ttl_ms: section.ttl_ms,
            max_entries_per_session: section.max_entries_per_session,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ProviderSection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub endpoint_fallbacks: Vec<String>,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl GatewayConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p: &Path = path.as_ref();
        let content = fs::read_to_string(p)
            .with_context(|| format!("failed to read config file at {}", p.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file at {}", p.display()))
    }

    pub fn router_config(&self) -> RouterConfig {
        let model_mapping = self
            .model_mappings
            .iter()
            .map(|entry| {
                (
                    entry.from.clone(),
                    ModelMapping {
                        provider: entry.provider.clone(),
                        model: entry.model.clone(),
                        fallbacks: entry.fallbacks.clone(),
                    },
                )
            })
            .collect();
        RouterConfig {
            model_mapping,
            default_provider: self.default_provider.clone().unwrap_or_else(|| "openai".to_string()),
            fallback_order: Vec::new(),
        }
    }

    pub fn endpoints(&self) -> HashMap<String, EndpointConfig> {
        let mut out: HashMap<String, EndpointConfig> = default_endpoints();
        for (name, section) in &self.providers {
            let entry = out.entry(name.clone()).or_insert_with(|| EndpointConfig {
                base_url: String::new(),
                endpoint_fallbacks: Vec::new(),
            });
            if let Some(base_url) = &section.base_url {
                entry.base_url = base_url.clone();
            }
            if !section.endpoint_fallbacks.is_empty() {
                entry.endpoint_fallbacks = section.endpoint_fallbacks.clone();
            }
        }
        out
    }

    pub fn credentials(&self) -> HashMap<String, Vec<Credential>> {
        let mut out = HashMap::new();
        for (provider, section) in &self.providers {
            if section.api_keys.is_empty() {
                continue;
            }
            let creds = section
                .api_keys
                .iter()
                .enumerate()
                .map(|(i, secret)| Credential {
                    id: format!("{provider}-{i}"),
                    provider: provider.clone(),
                    secret: secret.clone(),
                    expires_at_ms: None,
                })
                .collect();
            out.insert(provider.clone(), creds);
        }
        out
    }
}

/// §6's egress table, overridable per provider from the config file.
fn default_endpoints() -> HashMap<String, EndpointConfig> {
    let mut m = HashMap::new();
    m.insert(
        "openai".to_string(),
        EndpointConfig {
            base_url: "https://api.openai.com/v1/chat/completions".to_string(),
            endpoint_fallbacks: Vec::new(),
        },
    );
    m.insert(
        "anthropic".to_string(),
        EndpointConfig {
            base_url: "https://api.anthropic.com/v1/messages".to_string(),
            endpoint_fallbacks: Vec::new(),
        },
    );
    m.insert(
        "gemini".to_string(),
        EndpointConfig {
            base_url: "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent"
                .to_string(),
            endpoint_fallbacks: Vec::new(),
        },
    );
    m.insert(
        "antigravity".to_string(),
        EndpointConfig {
            base_url: String::new(),
            endpoint_fallbacks: Vec::new(),
        },
    );
    m.insert(
        "openai-web".to_string(),
        EndpointConfig {
            base_url: "https://chatgpt.com/backend-api/codex/responses".to_string(),
            endpoint_fallbacks: Vec::new(),
        },
    );
    m
}
