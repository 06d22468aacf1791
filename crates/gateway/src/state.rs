//! Process-global state assembled once at startup and shared across
//! request handlers via axum's `State` extractor, mirroring the ancestor
//! service's `ServerState { registry, auth_key }` shape.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use proxy_core::cooldown::CooldownManager;
use proxy_core::credentials::{Credential, CredentialPool, CredentialRefresher};
use proxy_core::dispatch::{DispatchEngine, EndpointConfig};
use proxy_core::router::Router;
use proxy_core::signature_cache::{InMemorySignatureStore, SignatureCacheConfig, SignatureStore};
use proxy_core::transformer::TransformerRegistryBuilder;

use crate::config::GatewayConfig;

/// Idle timeout ≥ 255s (§5) for long-running streamed generations; one
/// process-wide client so connection pooling is shared across requests.
static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(255))
        .build()
        .expect("failed to build reqwest client")
});

/// OAuth login flows and the on-disk credential store are out of this
/// system's scope (§1) — only the read/refresh contract is specified.
/// This gateway ships static API-key credentials that never expire, so
/// refresh is never actually invoked; this refresher exists to satisfy
/// the contract for whoever wires in a real OAuth collaborator later.
pub struct NoopRefresher;

#[async_trait]
impl CredentialRefresher for NoopRefresher {
    async fn refresh(&self, _credential: &Credential) -> Result<Credential, String> {
        Err("credential refresh is not configured on this gateway".to_string())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub dispatch: Arc<DispatchEngine>,
    pub auth_key: Option<String>,
    pub cors_origins: Vec<String>,
}

impl AppState {
    pub fn new(config: &GatewayConfig, auth_key: Option<String>) -> Self {
        let registry = Arc::new(
            TransformerRegistryBuilder::new()
                .register(Arc::new(dialect_openai::OpenAiTransformer))
                .register(Arc::new(dialect_anthropic::AnthropicTransformer))
                .register(Arc::new(dialect_gemini::GeminiTransformer))
                .register(Arc::new(dialect_antigravity::AntigravityTransformer))
                .register(Arc::new(dialect_opencode_zen::OpencodeZenTransformer))
                .register(Arc::new(dialect_openai_web::OpenAiWebTransformer))
                .register(Arc::new(proxy_core::responses::ResponsesTransformer))
                .build(),
        );

        let signatures: Arc<dyn SignatureStore> =
            Arc::new(InMemorySignatureStore::new(SignatureCacheConfig::from(&config.signature_cache)));

        let endpoints: HashMap<String, EndpointConfig> = config.endpoints();

        let dispatch = DispatchEngine {
            registry,
            router: Router::new(config.router_config()),
            cooldowns: Arc::new(CooldownManager::new()),
            credentials: Arc::new(CredentialPool::new(config.credentials())),
            signatures,
            http: HTTP_CLIENT.clone(),
            endpoints,
            refresher: Arc::new(NoopRefresher),
        };

        Self {
            dispatch: Arc::new(dispatch),
            auth_key,
            cors_origins: config.cors_origins.clone(),
        }
    }
}
