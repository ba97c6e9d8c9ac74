//! Header + payload encoding of task results
//!
//! The header is a short tag naming the payload encoding; the payload is
//! the JSON serialisation of the value.

use bytes::Bytes;
use serde_json::Value;

use super::StorageError;

/// Header tag of JSON payloads
pub const JSON_HEADER: &[u8] = b"ARJ1";

/// An encoded value ready to be stored or served to peers
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPayload {
    pub header: Bytes,
    pub payload: Bytes,
}

impl EncodedPayload {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

pub fn encode(value: &Value) -> Result<EncodedPayload, StorageError> {
    let payload = serde_json::to_vec(value).map_err(|e| StorageError::Encoding(e.to_string()))?;
    Ok(EncodedPayload {
        header: Bytes::from_static(JSON_HEADER),
        payload: Bytes::from(payload),
    })
}

/// Decode a payload; an empty header is treated as JSON
pub fn decode(header: &[u8], payload: &[u8]) -> Result<Value, StorageError> {
    if !header.is_empty() && header != JSON_HEADER {
        return Err(StorageError::Encoding(format!(
            "unsupported payload header {:?}",
            String::from_utf8_lossy(header)
        )));
    }
    if payload.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(payload).map_err(|e| StorageError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_sets_header_and_size() {
        let encoded = encode(&json!([1, 2, 3])).unwrap();
        assert_eq!(&encoded.header[..], JSON_HEADER);
        assert_eq!(encoded.size(), "[1,2,3]".len());
        assert_eq!(decode(&encoded.header, &encoded.payload).unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_decode_rejects_unknown_header() {
        let err = decode(b"BSON", b"{}").unwrap_err();
        assert!(err.to_string().contains("unsupported payload header"));
    }

    #[test]
    fn test_decode_empty_payload_is_null() {
        assert_eq!(decode(b"", b"").unwrap(), Value::Null);
    }
}
