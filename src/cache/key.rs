//! 缓存键

use sha2::{Digest, Sha256};

use crate::core::Intent;

/// 小写、去首尾空白、合并连续空白
pub fn normalize_query(query: &str) -> String {
    query
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// sha256(`normalized|intent_type|spatial`) 的十六进制串
pub fn cache_key(query: &str, intent: &Intent) -> String {
    let material = format!(
        "{}|{}|{}",
        normalize_query(query),
        intent.intent_type.as_str(),
        intent.is_spatial
    );
    hex::encode(Sha256::digest(material.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IntentType;

    #[test]
    fn test_key_is_deterministic_under_normalization() {
        let intent = Intent::default();
        assert_eq!(
            cache_key("  杭州的 5A  景区 ", &intent),
            cache_key("杭州的 5a 景区", &intent)
        );
        assert_eq!(cache_key("q", &intent).len(), 64);
    }

    #[test]
    fn test_key_depends_on_intent_and_spatial() {
        let query = Intent::default();
        let summary = Intent {
            intent_type: IntentType::Summary,
            ..Intent::default()
        };
        let spatial = Intent {
            is_spatial: true,
            ..Intent::default()
        };
        let base = cache_key("杭州的景区", &query);
        assert_ne!(base, cache_key("杭州的景区", &summary));
        assert_ne!(base, cache_key("杭州的景区", &spatial));
    }
}
