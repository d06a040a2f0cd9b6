//! Lenient field decoders
//!
//! The backend is not consistent about scalar encodings: ids arrive as
//! strings or integers, progress as numbers or numeric strings. These
//! helpers accept every encoding we have seen and reject anything else, so a
//! malformed field fails the record instead of being silently coerced.

use serde::de::{self, Deserialize, Deserializer};
use serde_json::Value;

/// Deserialize an identifier that may be a string or an integer
pub fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected a non-empty string or integer id, got {}",
            other
        ))),
    }
}

/// Deserialize an optional identifier that may be a string or an integer
pub fn opt_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(de::Error::custom(format!(
            "expected a string or integer id, got {}",
            other
        ))),
    }
}

/// Deserialize an optional float that may be a number or a numeric string
pub fn opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expected a number, got {:?}", s))),
        Some(other) => Err(de::Error::custom(format!(
            "expected a number, got {}",
            other
        ))),
    }
}

/// Deserialize an optional list of strings, accepting a single string too
pub fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s]),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                // Some backends send `{ "url": "..." }` image descriptors
                Value::Object(map) => match map.get("url") {
                    Some(Value::String(s)) => Ok(s.clone()),
                    _ => Err(de::Error::custom("image object without a `url` string")),
                },
                other => Err(de::Error::custom(format!(
                    "expected a string list item, got {}",
                    other
                ))),
            })
            .collect(),
        Some(other) => Err(de::Error::custom(format!(
            "expected a list of strings, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "id_string")]
        id: String,
        #[serde(default, deserialize_with = "opt_f64")]
        progress: Option<f64>,
        #[serde(default, deserialize_with = "string_list")]
        images: Vec<String>,
    }

    #[test]
    fn test_numeric_id_becomes_string() {
        let probe: Probe = serde_json::from_str(r#"{"id": 42}"#).unwrap();
        assert_eq!(probe.id, "42");
        assert_eq!(probe.progress, None);
        assert!(probe.images.is_empty());
    }

    #[test]
    fn test_progress_accepts_numeric_string() {
        let probe: Probe = serde_json::from_str(r#"{"id": "a", "progress": "0.25"}"#).unwrap();
        assert_eq!(probe.progress, Some(0.25));
    }

    #[test]
    fn test_progress_rejects_garbage() {
        let result = serde_json::from_str::<Probe>(r#"{"id": "a", "progress": "lots"}"#);
        assert!(result.is_err());
        let result = serde_json::from_str::<Probe>(r#"{"id": "a", "progress": [1]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(serde_json::from_str::<Probe>(r#"{"id": "  "}"#).is_err());
    }

    #[test]
    fn test_images_accept_single_string_and_objects() {
        let probe: Probe = serde_json::from_str(r#"{"id": "a", "images": "one.png"}"#).unwrap();
        assert_eq!(probe.images, vec!["one.png"]);

        let probe: Probe =
            serde_json::from_str(r#"{"id": "a", "images": [{"url": "u1"}, "u2"]}"#).unwrap();
        assert_eq!(probe.images, vec!["u1", "u2"]);
    }
}
