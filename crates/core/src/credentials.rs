//! Per-provider ordered credential list with round-robin rotation and a
//! refresh hook, single-flighted per credential (C7).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub provider: String,
    pub secret: String,
    /// Unix millis; `None` means it never expires (e.g. a static API key).
    pub expires_at_ms: Option<u64>,
}

impl Credential {
    fn now_ms() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Invariant 5: valid iff not expired, or refreshable within grace.
    pub fn is_expiring_within(&self, grace_ms: u64) -> bool {
        match self.expires_at_ms {
            Some(expires) => expires <= Self::now_ms() + grace_ms,
            None => false,
        }
    }
}

/// `refresh(credential) -> credential`. Implemented externally (OAuth
/// token refresh lives outside this crate's scope per §1); this is just
/// the contract.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, credential: &Credential) -> Result<Credential, String>;
}

const DEFAULT_GRACE_MS: u64 = 60_000;

pub struct CredentialPool {
    credentials: tokio::sync::RwLock<HashMap<String, Vec<Credential>>>,
    next_index: HashMap<String, AtomicUsize>,
    refresh_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    unavailable: tokio::sync::RwLock<HashSet<(String, usize)>>,
}

impl CredentialPool {
    pub fn new(credentials: HashMap<String, Vec<Credential>>) -> Self {
        let next_index = credentials
            .keys()
            .map(|k| (k.clone(), AtomicUsize::new(0)))
            .collect();
        Self {
            credentials: tokio::sync::RwLock::new(credentials),
            next_index,
            refresh_locks: AsyncMutex::new(HashMap::new()),
            unavailable: tokio::sync::RwLock::new(HashSet::new()),
        }
    }

    /// Returns `provider`'s credential list with each credential refreshed
    /// if it's expiring within the grace window. Concurrent callers for the
    /// same credential share one refresh RTT via a per-credential
    /// single-flight mutex.
    pub async fn ensure_fresh(
        &self,
        provider: &str,
        refresher: &dyn CredentialRefresher,
    ) -> Vec<Credential> {
        let snapshot = {
            let creds = self.credentials.read().await;
            creds.get(provider).cloned().unwrap_or_default()
        };

        let mut refreshed = Vec::with_capacity(snapshot.len());
        for cred in snapshot {
            if !cred.is_expiring_within(DEFAULT_GRACE_MS) {
                refreshed.push(cred);
                continue;
            }
            let lock = {
                let mut locks = self.refresh_locks.lock().await;
                locks
                    .entry(cred.id.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                    .clone()
            };
            let _guard = lock.lock().await;
            // re-check after acquiring the lock: another task may have
            // already refreshed this credential while we waited.
            let current = {
                let creds = self.credentials.read().await;
                creds
                    .get(provider)
                    .and_then(|list| list.iter().find(|c| c.id == cred.id).cloned())
                    .unwrap_or_else(|| cred.clone())
            };
            if !current.is_expiring_within(DEFAULT_GRACE_MS) {
                refreshed.push(current);
                continue;
            }
            match refresher.refresh(&current).await {
                Ok(new_cred) => {
                    let mut creds = self.credentials.write().await;
                    if let Some(list) = creds.get_mut(provider) {
                        if let Some(slot) = list.iter_mut().find(|c| c.id == new_cred.id) {
                            *slot = new_cred.clone();
                        }
                    }
                    refreshed.push(new_cred);
                }
                Err(_) => refreshed.push(current),
            }
        }
        refreshed
    }

    /// Returns the index of the next credential not marked unavailable for
    /// this provider within the current request. The "next index" itself
    /// is a relaxed counter (§5): duplicate picks across races are
    /// acceptable, since the cooldown manager catches rate-limits on reuse.
    pub async fn get_next_available(&self, provider: &str, creds: &[Credential]) -> Option<usize> {
        if creds.is_empty() {
            return None;
        }
        let counter = self.next_index.get(provider);
        let unavailable = self.unavailable.read().await;
        for attempt in 0..creds.len() {
            let idx = match counter {
                Some(c) => c.fetch_add(1, Ordering::Relaxed) % creds.len(),
                None => attempt % creds.len(),
            };
            if !unavailable.contains(&(provider.to_string(), idx)) {
                return Some(idx);
            }
        }
        None
    }

    /// Marks a credential index unavailable for the remainder of a single
    /// logical request (e.g. after an auth failure).
    pub async fn mark_unavailable(&self, provider: &str, index: usize) {
        self.unavailable
            .write()
            .await
            .insert((provider.to_string(), index));
    }

    pub async fn clear_unavailable(&self) {
        self.unavailable.write().await.clear();
    }
}

/// Header construction per provider (§4.6 / §6 egress table).
pub fn auth_headers(provider: &str, credential: &Credential) -> Vec<(&'static str, String)> {
    match provider {
        "anthropic" => vec![
            ("x-api-key", credential.secret.clone()),
            ("anthropic-version", "2023-06-01".to_string()),
        ],
        "gemini" => vec![("x-goog-api-key", credential.secret.clone())],
        "antigravity" => vec![("authorization", format!("Bearer {}", credential.secret))],
        "openai-web" => vec![
            ("authorization", format!("Bearer {}", credential.secret)),
            ("openai-beta", "responses=experimental".to_string()),
            ("originator", "codex_cli_rs".to_string()),
        ],
        // openai and anything opencode-zen eventually delegates to.
        _ => vec![("authorization", format!("Bearer {}", credential.secret))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopRefresher;
    #[async_trait]
    impl CredentialRefresher for NoopRefresher {
        async fn refresh(&self, credential: &Credential) -> Result<Credential, String> {
            Ok(Credential {
                expires_at_ms: Some(u64::MAX),
                ..credential.clone()
            })
        }
    }

    fn cred(id: &str) -> Credential {
        Credential {
            id: id.to_string(),
            provider: "openai".to_string(),
            secret: format!("secret-{id}"),
            expires_at_ms: None,
        }
    }

    #[tokio::test]
    async fn round_robin_cycles_indices() {
        let mut map = HashMap::new();
        map.insert("openai".to_string(), vec![cred("a"), cred("b")]);
        let pool = CredentialPool::new(map);
        let creds = vec![cred("a"), cred("b")];
        let first = pool.get_next_available("openai", &creds).await.unwrap();
        let second = pool.get_next_available("openai", &creds).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn unavailable_indices_are_skipped() {
        let mut map = HashMap::new();
        map.insert("openai".to_string(), vec![cred("a"), cred("b")]);
        let pool = CredentialPool::new(map);
        pool.mark_unavailable("openai", 0).await;
        pool.mark_unavailable("openai", 1).await;
        let creds = vec![cred("a"), cred("b")];
        assert_eq!(pool.get_next_available("openai", &creds).await, None);
    }

    #[tokio::test]
    async fn ensure_fresh_refreshes_expiring_credentials() {
        let mut expiring = cred("a");
        expiring.expires_at_ms = Some(0);
        let mut map = HashMap::new();
        map.insert("openai".to_string(), vec![expiring]);
        let pool = CredentialPool::new(map);
        let refreshed = pool.ensure_fresh("openai", &NoopRefresher).await;
        assert_eq!(refreshed[0].expires_at_ms, Some(u64::MAX));
    }

    #[test]
    fn anthropic_headers_use_x_api_key() {
        let headers = auth_headers("anthropic", &cred("a"));
        assert!(headers.iter().any(|(k, _)| *k == "x-api-key"));
        assert!(headers.iter().any(|(k, v)| *k == "anthropic-version" && v == "2023-06-01"));
    }
}
