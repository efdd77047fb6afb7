//! Content hashing for model, data and instance identities.
//!
//! Two configurations that mean the same thing must hash the same. Object
//! keys are already canonical because `serde_json::Map` keeps them sorted;
//! top-level arrays are sorted here so list order in a hand-written config
//! never changes an id. Nested arrays are left alone, since order can be
//! meaningful below the top level.

use std::cmp::Ordering;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::InstanceError;

/// SHA-256 of the UTF-8 bytes, as lowercase hex.
#[must_use]
pub fn hash_string(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hashes any serializable configuration into a stable id.
///
/// The value is canonicalized before hashing: keys sorted at every level,
/// top-level arrays sorted, compact serialization. Datetimes arrive here as
/// the ISO-8601 strings chrono's serde emits, so they take part in the hash
/// as text.
///
/// # Errors
///
/// Returns [`InstanceError::Serialize`] if the value cannot be represented
/// as JSON.
pub fn hash_config<T: Serialize>(config: &T) -> Result<String, InstanceError> {
    let mut value = serde_json::to_value(config)?;
    sort_top_level_arrays(&mut value);
    Ok(hash_string(&value.to_string()))
}

/// Combines the four identity fields into an instance id.
///
/// The concatenation order is `model_name + param_id + git_hash + data_id`.
/// It is part of the stored-id contract and cannot change without orphaning
/// every existing `air_quality_instance` row.
#[must_use]
pub fn instance_id_from_hash(
    model_name: &str,
    param_id: &str,
    data_id: &str,
    git_hash: &str,
) -> String {
    hash_string(&format!("{model_name}{param_id}{git_hash}{data_id}"))
}

/// Reads the `GIT_HASH` environment variable.
///
/// A missing value logs an error and falls back to the empty string, so an
/// instance created outside a build pipeline still gets a usable id.
#[must_use]
pub fn git_hash() -> String {
    std::env::var("GIT_HASH").unwrap_or_else(|_| {
        log::error!("GIT_HASH is not set; instance ids will hash an empty git hash");
        String::new()
    })
}

fn sort_top_level_arrays(value: &mut Value) {
    match value {
        Value::Array(items) => items.sort_by(compare_values),
        Value::Object(members) => {
            for member in members.values_mut() {
                if let Value::Array(items) = member {
                    items.sort_by(compare_values);
                }
            }
        }
        _ => {}
    }
}

/// Total order over JSON values: null, then booleans, numbers, strings,
/// arrays, objects; like kinds compare by content.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(f64::NAN)
            .total_cmp(&y.as_f64().unwrap_or(f64::NAN)),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(u, v)| compare_values(u, v))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        // Maps keep their keys sorted, so the serialized form is canonical.
        (Value::Object(..), Value::Object(..)) => a.to_string().cmp(&b.to_string()),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

const fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(..) => 1,
        Value::Number(..) => 2,
        Value::String(..) => 3,
        Value::Array(..) => 4,
        Value::Object(..) => 5,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;
    use serde_json::json;

    use super::*;

    #[test]
    fn hash_string_matches_known_digests() {
        assert_eq!(
            hash_string(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hash_string("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn key_order_does_not_change_the_hash() {
        let first = hash_config(&json!({"train_sources": ["laqn"], "species": ["NO2"]})).unwrap();
        let second = hash_config(&json!({"species": ["NO2"], "train_sources": ["laqn"]})).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn top_level_list_order_does_not_change_the_hash() {
        let first = hash_config(&json!({"key": ["a", "b"]})).unwrap();
        let second = hash_config(&json!({"key": ["b", "a"]})).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn nested_list_order_is_preserved() {
        let first = hash_config(&json!({"outer": {"inner": ["a", "b"]}})).unwrap();
        let second = hash_config(&json!({"outer": {"inner": ["b", "a"]}})).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn mixed_type_lists_sort_deterministically() {
        let mut shuffled = json!(["b", 2.0, null, true, 1, "a"]);
        sort_top_level_arrays(&mut shuffled);

        assert_eq!(shuffled, json!([null, true, 1, 2.0, "a", "b"]));
    }

    #[test]
    fn instance_id_concatenates_in_canonical_order() {
        let id = instance_id_from_hash("svgp", "param", "data", "git");

        assert_eq!(id, hash_string("svgpparamgitdata"));
        assert_ne!(id, instance_id_from_hash("svgp", "param", "git", "data"));
    }

    #[test]
    fn datetimes_hash_as_text() {
        let when = chrono::Utc.with_ymd_and_hms(2021, 3, 1, 9, 0, 0).unwrap();

        let value = serde_json::to_value(when).unwrap();
        assert!(value.is_string());

        let direct = hash_config(&json!({"start": when})).unwrap();
        let via_text = hash_config(&json!({"start": value})).unwrap();
        assert_eq!(direct, via_text);
    }
}
