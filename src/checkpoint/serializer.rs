//! State serializers for checkpoint blobs.

use crate::models::{EtlError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes step state into an opaque blob and back.
///
/// `format` becomes the state file extension, so it must be a plain token
/// such as `json`.
pub trait StateSerializer: Send + Sync {
    fn format(&self) -> &str;

    fn encode<S: Serialize + ?Sized>(&self, state: &S) -> Result<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// serde_json serializer, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer {
    pretty: bool,
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indented output, for state that people read by hand.
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl StateSerializer for JsonSerializer {
    fn format(&self) -> &str {
        "json"
    }

    fn encode<S: Serialize + ?Sized>(&self, state: &S) -> Result<Vec<u8>> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(state)?
        } else {
            serde_json::to_vec(state)?
        };
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| EtlError::Serialization(format!("decoding {} state: {e}", self.format())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_json_preserves_nested_state() {
        let mut state: BTreeMap<String, Vec<Option<i64>>> = BTreeMap::new();
        state.insert("ids".to_string(), vec![Some(1), None, Some(-3)]);

        for serializer in [JsonSerializer::new(), JsonSerializer::pretty()] {
            let bytes = serializer.encode(&state).unwrap();
            let back: BTreeMap<String, Vec<Option<i64>>> = serializer.decode(&bytes).unwrap();
            assert_eq!(back, state);
        }
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let err = JsonSerializer::new()
            .decode::<Vec<u32>>(b"{not json")
            .unwrap_err();
        assert!(matches!(err, EtlError::Serialization(_)));
    }
}
