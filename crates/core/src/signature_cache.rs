//! Per-session, TTL-bounded, capacity-bounded thinking-block signature
//! cache (C4).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

const DEFAULT_TTL_MS: u64 = 3_600_000;
const DEFAULT_MAX_ENTRIES_PER_SESSION: usize = 100;
/// Invariant 4: a signature is valid only if it's at least this long.
const MIN_SIGNATURE_LEN: usize = 50;

#[derive(Debug, Clone)]
pub struct SignatureEntry {
    pub signature: String,
    pub family: String,
    pub timestamp_ms: u64,
    pub session_id: String,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `validate(sig) ≡ sig.length ≥ 50`.
pub fn validate_signature(signature: &str) -> bool {
    signature.len() >= MIN_SIGNATURE_LEN
}

/// `entryKey = model + ":" + textHash`, where `textHash` is the 32-bit
/// deterministic hash from the GLOSSARY: `h = 0; h = (h<<5) - h + code(c)`
/// over every char, then base-36 of `|h|`.
pub fn text_hash(text: &str) -> String {
    let mut h: i64 = 0;
    for c in text.chars() {
        h = (h << 5).wrapping_sub(h).wrapping_add(c as i64);
        h &= 0xffff_ffff;
    }
    to_base36(h.unsigned_abs())
}

pub fn entry_key(model: &str, text: &str) -> String {
    format!("{model}:{}", text_hash(text))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

#[async_trait]
pub trait SignatureStore: Send + Sync {
    async fn store(&self, session_id: &str, key: &str, signature: &str, family: &str);
    async fn restore(&self, session_id: &str, key: &str) -> Option<SignatureEntry>;
    async fn clear_session(&self, session_id: &str);
}

pub struct SignatureCacheConfig {
    pub ttl_ms: u64,
    pub max_entries_per_session: usize,
}

impl Default for SignatureCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEFAULT_TTL_MS,
            max_entries_per_session: DEFAULT_MAX_ENTRIES_PER_SESSION,
        }
    }
}

/// In-memory map-of-maps backend. Single-writer-per-session semantics are
/// satisfied cheaply with one process-wide mutex; cross-session contention
/// is accepted at this implementation's scale (see DESIGN.md).
pub struct InMemorySignatureStore {
    config: SignatureCacheConfig,
    sessions: Mutex<HashMap<String, HashMap<String, SignatureEntry>>>,
}

impl InMemorySignatureStore {
    pub fn new(config: SignatureCacheConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Lazily sweeps entries older than `ttl` for one session, then
    /// enforces the per-session cap by evicting lowest-timestamp entries.
    fn sweep_and_cap(entries: &mut HashMap<String, SignatureEntry>, ttl_ms: u64, cap: usize) {
        let now = now_ms();
        entries.retain(|_, e| now.saturating_sub(e.timestamp_ms) <= ttl_ms);
        while entries.len() > cap {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.timestamp_ms)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl SignatureStore for InMemorySignatureStore {
    async fn store(&self, session_id: &str, key: &str, signature: &str, family: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        let entries = sessions.entry(session_id.to_string()).or_default();
        entries.insert(
            key.to_string(),
            SignatureEntry {
                signature: signature.to_string(),
                family: family.to_string(),
                timestamp_ms: now_ms(),
                session_id: session_id.to_string(),
            },
        );
        Self::sweep_and_cap(entries, self.config.ttl_ms, self.config.max_entries_per_session);
    }

    async fn restore(&self, session_id: &str, key: &str) -> Option<SignatureEntry> {
        let mut sessions = self.sessions.lock().unwrap();
        let entries = sessions.entry(session_id.to_string()).or_default();
        Self::sweep_and_cap(entries, self.config.ttl_ms, self.config.max_entries_per_session);
        entries.get(key).cloned()
    }

    async fn clear_session(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }
}

#[cfg(feature = "durable-signatures")]
pub mod durable {
    //! SQLite-backed durable store, grounded on the ancestor's
    //! `sqlx`-based session store idiom (see DESIGN.md for why `sqlx` was
    //! added as a new dependency here).
    use super::*;
    use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

    pub struct SqliteSignatureStore {
        pool: SqlitePool,
        config: SignatureCacheConfig,
    }

    impl SqliteSignatureStore {
        pub async fn new(database_url: &str, config: SignatureCacheConfig) -> Result<Self, sqlx::Error> {
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS signatures (
                    session_id TEXT NOT NULL,
                    entry_key TEXT NOT NULL,
                    signature TEXT NOT NULL,
                    family TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    PRIMARY KEY (session_id, entry_key)
                );",
            )
            .execute(&pool)
            .await?;
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_signatures_session ON signatures(session_id);")
                .execute(&pool)
                .await?;
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_signatures_timestamp ON signatures(timestamp);")
                .execute(&pool)
                .await?;
            Ok(Self { pool, config })
        }
    }

    #[async_trait]
    impl SignatureStore for SqliteSignatureStore {
        async fn store(&self, session_id: &str, key: &str, signature: &str, family: &str) {
            let now = now_ms() as i64;
            let _ = sqlx::query(
                "INSERT INTO signatures (session_id, entry_key, signature, family, timestamp)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(session_id, entry_key) DO UPDATE SET
                   signature = excluded.signature, family = excluded.family, timestamp = excluded.timestamp",
            )
            .bind(session_id)
            .bind(key)
            .bind(signature)
            .bind(family)
            .bind(now)
            .execute(&self.pool)
            .await;

            let cap = self.config.max_entries_per_session as i64;
            let _ = sqlx::query(
                "DELETE FROM signatures WHERE session_id = ? AND entry_key NOT IN (
                    SELECT entry_key FROM signatures WHERE session_id = ?
                    ORDER BY timestamp DESC LIMIT ?
                 )",
            )
            .bind(session_id)
            .bind(session_id)
            .bind(cap)
            .execute(&self.pool)
            .await;
        }

        async fn restore(&self, session_id: &str, key: &str) -> Option<SignatureEntry> {
            let cutoff = now_ms().saturating_sub(self.config.ttl_ms) as i64;
            let _ = sqlx::query("DELETE FROM signatures WHERE session_id = ? AND timestamp < ?")
                .bind(session_id)
                .bind(cutoff)
                .execute(&self.pool)
                .await;

            let row = sqlx::query(
                "SELECT signature, family, timestamp FROM signatures WHERE session_id = ? AND entry_key = ?",
            )
            .bind(session_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .ok()??;

            Some(SignatureEntry {
                signature: row.get::<String, _>("signature"),
                family: row.get::<String, _>("family"),
                timestamp_ms: row.get::<i64, _>("timestamp") as u64,
                session_id: session_id.to_string(),
            })
        }

        async fn clear_session(&self, session_id: &str) {
            let _ = sqlx::query("DELETE FROM signatures WHERE session_id = ?")
                .bind(session_id)
                .execute(&self.pool)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_sig(tag: &str) -> String {
        format!("{:-<55}", tag)
    }

    #[tokio::test]
    async fn store_is_idempotent() {
        let store = InMemorySignatureStore::new(SignatureCacheConfig::default());
        let sig = long_sig("a");
        store.store("s1", "k1", &sig, "claude").await;
        store.store("s1", "k1", &sig, "claude").await;
        let entries = store.sessions.lock().unwrap();
        assert_eq!(entries.get("s1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cap_enforced_evicting_oldest() {
        let store = InMemorySignatureStore::new(SignatureCacheConfig {
            ttl_ms: DEFAULT_TTL_MS,
            max_entries_per_session: 3,
        });
        for i in 0..5u32 {
            let sig = long_sig(&i.to_string());
            store.store("s1", &format!("k{i}"), &sig, "claude").await;
            // force strictly increasing timestamps deterministically
            let mut sessions = store.sessions.lock().unwrap();
            if let Some(e) = sessions.get_mut("s1").and_then(|m| m.get_mut(&format!("k{i}"))) {
                e.timestamp_ms = i as u64 * 1000;
            }
        }
        assert!(store.restore("s1", "k0").await.is_none());
        for i in 2..5u32 {
            assert!(store.restore("s1", &format!("k{i}")).await.is_some());
        }
    }

    #[test]
    fn signature_validation() {
        assert!(!validate_signature("short"));
        assert!(validate_signature(&long_sig("ok")));
    }

    #[test]
    fn text_hash_is_deterministic() {
        assert_eq!(text_hash("hello"), text_hash("hello"));
        assert_ne!(text_hash("hello"), text_hash("world"));
    }
}
