use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TokenMediaError};

/// Raw token metadata as returned by a chain or provider.
///
/// Only a handful of keys are interpreted; everything else is carried
/// verbatim so the persisted JSON matches what was received.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenMetadata(Map<String, Value>);

impl TokenMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts only JSON objects
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
            .ok_or_else(|| TokenMediaError::InvalidMetadata("expected a JSON object".into()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Non-empty string value at `key`, trimmed
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    pub fn description(&self) -> Option<&str> {
        self.get_str("description")
    }

    fn media_field(&self, key: &str) -> Option<&str> {
        self.0
            .get("media")
            .and_then(|media| media.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// `media.mimeType`
    pub fn media_mime_type(&self) -> Option<&str> {
        self.media_field("mimeType")
    }

    /// `media.uri`
    pub fn media_uri(&self) -> Option<&str> {
        self.media_field("uri")
    }

    /// `media_type`, falling back to `format`
    pub fn media_type_hint(&self) -> Option<&str> {
        self.get_str("media_type").or_else(|| self.get_str("format"))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for TokenMetadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extracts_known_fields() {
        let metadata = TokenMetadata::from_value(json!({
            "name": "  Pixel ",
            "description": "",
            "media": {"mimeType": "video/mp4", "uri": "ipfs://bafy/v.mp4"},
            "format": "mp4"
        }))
        .unwrap();

        assert_eq!(metadata.name(), Some("Pixel"));
        assert_eq!(metadata.description(), None);
        assert_eq!(metadata.media_mime_type(), Some("video/mp4"));
        assert_eq!(metadata.media_uri(), Some("ipfs://bafy/v.mp4"));
        assert_eq!(metadata.media_type_hint(), Some("mp4"));
    }

    #[test]
    fn test_rejects_non_objects() {
        assert!(TokenMetadata::from_value(json!([1, 2])).is_none());
        assert!(TokenMetadata::from_json("\"image\"").is_err());
    }

    #[test]
    fn test_unknown_fields_survive_serialization() {
        let raw = r#"{"name":"A","attributes":[{"trait_type":"Eyes","value":"Laser"}],"n":1.5}"#;
        let metadata = TokenMetadata::from_json(raw).unwrap();
        let back: Value = serde_json::from_str(&serde_json::to_string(&metadata).unwrap()).unwrap();
        let original: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(back, original);
    }
}
