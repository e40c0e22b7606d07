//! Secret lookup (API keys, OAuth tokens, webhook targets).

use dashmap::DashMap;

pub const API_KEY: &str = "MAIL_RELAY_API_KEY";
pub const GOOGLE_ACCESS_TOKEN: &str = "GOOGLE_ACCESS_TOKEN";
pub const GOOGLE_REFRESH_TOKEN: &str = "GOOGLE_REFRESH_TOKEN";
pub const GOOGLE_CLIENT_ID: &str = "GOOGLE_CLIENT_ID";
pub const GOOGLE_CLIENT_SECRET: &str = "GOOGLE_CLIENT_SECRET";
pub const TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const TELEGRAM_CHAT_ID: &str = "TELEGRAM_CHAT_ID";
pub const SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

pub trait SecretStore: Send + Sync {
    /// Look up a secret; empty values count as unset
    fn get(&self, key: &str) -> Option<String>;
}

/// Secrets from the process environment, memoised for the life of the process
#[derive(Default)]
pub struct EnvSecretStore {
    cache: DashMap<String, Option<String>>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for EnvSecretStore {
    fn get(&self, key: &str) -> Option<String> {
        if let Some(cached) = self.cache.get(key) {
            return cached.clone();
        }
        let value = std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        self.cache.insert(key.to_string(), value.clone());
        value
    }
}

/// Fixed in-memory secrets
#[cfg(test)]
pub struct StaticSecretStore(pub std::collections::HashMap<String, String>);

#[cfg(test)]
impl StaticSecretStore {
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

#[cfg(test)]
impl SecretStore for StaticSecretStore {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).filter(|v| !v.trim().is_empty()).cloned()
    }
}

/// Compare a presented key with the expected one without early exit
pub fn keys_match(presented: &str, expected: &str) -> bool {
    let a = presented.as_bytes();
    let b = expected.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_store_memoises() {
        let store = EnvSecretStore::new();
        assert_eq!(store.get("MAIL_RELAY_TEST_SECRET_THAT_IS_NOT_SET"), None);
        assert!(store.cache.contains_key("MAIL_RELAY_TEST_SECRET_THAT_IS_NOT_SET"));
    }

    #[test]
    fn test_static_store_ignores_blank_values() {
        let store = StaticSecretStore::from_pairs(&[(API_KEY, "k"), (SLACK_WEBHOOK_URL, " ")]);
        assert_eq!(store.get(API_KEY).as_deref(), Some("k"));
        assert_eq!(store.get(SLACK_WEBHOOK_URL), None);
    }

    #[test]
    fn test_keys_match() {
        assert!(keys_match("secret", "secret"));
        assert!(!keys_match("secret", "secreT"));
        assert!(!keys_match("secret", "secret2"));
        assert!(!keys_match("", "x"));
    }
}
