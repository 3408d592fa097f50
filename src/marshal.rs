// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
use crate::error::{Error, Result};

/// Converts a task to and from bytes for storage in the payload store.
///
/// Marshallers operate on the task *including* its identifier field, so a
/// round-trip through the payload store preserves identity.
pub trait Marshaller<T> {
    fn marshal(&self, value: &T) -> Result<Vec<u8>>;
    fn unmarshal(&self, bytes: &[u8], out: &mut T) -> Result<()>;
}

/// Self-describing textual object encoding. The canonical default.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMarshaller;

impl<T> Marshaller<T> for JsonMarshaller
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    fn marshal(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(Error::Encoding)
    }

    fn unmarshal(&self, bytes: &[u8], out: &mut T) -> Result<()> {
        *out = serde_json::from_slice(bytes).map_err(Error::Encoding)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn round_trips_a_map() {
        let m = JsonMarshaller;
        let original: BTreeMap<String, serde_json::Value> =
            serde_json::from_value(json!({"f": "pleasure", "id": "abc-123"})).unwrap();
        let bytes = m.marshal(&original).unwrap();
        let mut out = BTreeMap::new();
        m.unmarshal(&bytes, &mut out).unwrap();
        assert_eq!(original, out);
    }

    #[test]
    fn surfaces_encoding_errors() {
        let m = JsonMarshaller;
        let mut out: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let err = m.unmarshal(b"not json", &mut out).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }
}
