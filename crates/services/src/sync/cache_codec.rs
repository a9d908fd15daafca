//! Encoding of the last-known progress values kept in the local cache.
//!
//! Keys are `progress:{user}:{plan}`; values are small JSON documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use study_core::model::{PlanId, UserId};

use crate::error::CacheDecodeError;

const KEY_PREFIX: &str = "progress";

/// Cached progress of one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedProgress {
    pub progress: u8,
    pub last_updated: DateTime<Utc>,
}

/// Prefix shared by every cache key of `user_id`.
#[must_use]
pub fn user_prefix(user_id: &UserId) -> String {
    format!("{KEY_PREFIX}:{user_id}:")
}

#[must_use]
pub fn cache_key(user_id: &UserId, plan_id: PlanId) -> String {
    format!("{}{plan_id}", user_prefix(user_id))
}

/// Plan id encoded in `key`, if `key` sits directly under `prefix`.
#[must_use]
pub fn plan_id_from_key(key: &str, prefix: &str) -> Option<PlanId> {
    key.strip_prefix(prefix)?.parse().ok()
}

/// Serialize a cached value.
///
/// # Errors
///
/// Returns `CacheDecodeError` if the value cannot be serialized.
pub fn encode(key: &str, value: &CachedProgress) -> Result<String, CacheDecodeError> {
    serde_json::to_string(value).map_err(|err| CacheDecodeError {
        key: key.to_owned(),
        reason: err.to_string(),
    })
}

/// Parse a cached value read back from `key`.
///
/// # Errors
///
/// Returns `CacheDecodeError` for malformed JSON or an out-of-range percentage.
pub fn decode(key: &str, raw: &str) -> Result<CachedProgress, CacheDecodeError> {
    let value: CachedProgress = serde_json::from_str(raw).map_err(|err| CacheDecodeError {
        key: key.to_owned(),
        reason: err.to_string(),
    })?;
    if value.progress > 100 {
        return Err(CacheDecodeError {
            key: key.to_owned(),
            reason: format!("progress {} is above 100", value.progress),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use study_core::time::fixed_now;

    #[test]
    fn keys_are_scoped_by_user() {
        let alice = UserId::new("alice");
        let key = cache_key(&alice, PlanId::new(12));
        assert_eq!(key, "progress:alice:12");
        assert_eq!(
            plan_id_from_key(&key, &user_prefix(&alice)),
            Some(PlanId::new(12))
        );
        assert_eq!(plan_id_from_key(&key, &user_prefix(&UserId::new("bob"))), None);
        assert_eq!(plan_id_from_key("progress:alice:x", "progress:alice:"), None);
    }

    #[test]
    fn stored_shape_is_camel_case_json() {
        let value = CachedProgress {
            progress: 42,
            last_updated: fixed_now(),
        };
        let raw = encode("k", &value).unwrap();
        assert!(raw.contains("\"lastUpdated\""));
        assert_eq!(decode("k", &raw).unwrap(), value);
    }

    #[test]
    fn corrupt_values_are_decode_errors() {
        let err = decode("progress:u:1", "{not json").unwrap_err();
        assert_eq!(err.key, "progress:u:1");

        let raw = r#"{"progress":140,"lastUpdated":"2024-01-01T00:00:00Z"}"#;
        assert!(decode("k", raw).is_err());
    }
}
