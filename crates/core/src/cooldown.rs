//! Per-(provider,model) rate-limit state (C5).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MIN_COOLDOWN_MS: u64 = 30_000;
pub const MAX_COOLDOWN_MS: u64 = 900_000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn cooldown_key(provider: &str, model: &str) -> String {
    format!("{provider}:{model}")
}

/// Keys never deleted (bounded by provider×model cardinality); reads
/// lock-free under a read lock, writes under a write lock.
#[derive(Default)]
pub struct CooldownManager {
    expires_at: RwLock<HashMap<String, u64>>,
}

impl CooldownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// `expiresAt = now + clamp(retryAfterMs, MIN_COOLDOWN_MS, MAX_COOLDOWN_MS)`.
    pub fn mark_rate_limited(&self, key: &str, retry_after_ms: Option<u64>) {
        let delta = retry_after_ms
            .unwrap_or(MIN_COOLDOWN_MS)
            .clamp(MIN_COOLDOWN_MS, MAX_COOLDOWN_MS);
        let expires_at = now_ms() + delta;
        self.expires_at
            .write()
            .unwrap()
            .insert(key.to_string(), expires_at);
    }

    /// Missing key = available.
    pub fn is_available(&self, key: &str) -> bool {
        match self.expires_at.read().unwrap().get(key) {
            Some(expires_at) => *expires_at <= now_ms(),
            None => true,
        }
    }

    pub fn all_cooled_down(&self, keys: &[String]) -> bool {
        keys.iter().all(|k| !self.is_available(k))
    }

    pub fn reset(&self, key: &str) {
        self.expires_at.write().unwrap().remove(key);
    }
}

/// Parses a `Retry-After` header value (seconds, or an HTTP-date) into
/// milliseconds.
pub fn parse_retry_after_header(value: &str) -> Option<u64> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(secs * 1000);
    }
    httpdate::parse_http_date(value.trim())
        .ok()
        .and_then(|date| {
            let now = SystemTime::now();
            date.duration_since(now).ok().map(|d| d.as_millis() as u64)
        })
}

/// Fallback when no header is present: scan the error body text for an
/// integer-seconds value associated with rate-limit wording. Defaults to
/// 30s if nothing is found.
pub fn extract_retry_after(header: Option<&str>, body_text: Option<&str>) -> u64 {
    if let Some(h) = header {
        if let Some(ms) = parse_retry_after_header(h) {
            return ms;
        }
    }
    if let Some(text) = body_text {
        if let Some(ms) = scan_body_for_retry_seconds(text) {
            return ms;
        }
    }
    30_000
}

fn scan_body_for_retry_seconds(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    if !lower.contains("rate limit") && !lower.contains("retry") && !lower.contains("try again") {
        return None;
    }
    let re = regex::Regex::new(r"(\d+(?:\.\d+)?)\s*(?:s|sec|seconds)\b").ok()?;
    re.captures(&lower)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_when_missing() {
        let mgr = CooldownManager::new();
        assert!(mgr.is_available("openai:gpt-4"));
    }

    #[test]
    fn mark_rate_limited_gates_until_expiry() {
        let mgr = CooldownManager::new();
        mgr.mark_rate_limited("openai:gpt-4", Some(1));
        // floored to MIN_COOLDOWN_MS, so still unavailable immediately
        assert!(!mgr.is_available("openai:gpt-4"));
    }

    #[test]
    fn ceiling_is_applied() {
        let mgr = CooldownManager::new();
        mgr.mark_rate_limited("k", Some(10_000_000));
        let expires = *mgr.expires_at.read().unwrap().get("k").unwrap();
        assert!(expires <= now_ms() + MAX_COOLDOWN_MS + 5);
    }

    #[test]
    fn retry_after_seconds_parses() {
        assert_eq!(parse_retry_after_header("5"), Some(5000));
    }

    #[test]
    fn retry_after_defaults_to_30s() {
        assert_eq!(extract_retry_after(None, None), 30_000);
    }

    #[test]
    fn retry_after_scans_body() {
        let body = "rate limit exceeded, retry in 12 seconds";
        assert_eq!(extract_retry_after(None, Some(body)), 12_000);
    }
}
