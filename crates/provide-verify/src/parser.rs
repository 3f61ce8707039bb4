//! Provider-record parser.
//!
//! The node logs free text with an embedded JSON payload, e.g.
//!
//! ```text
//! 2025-01-01T00:00:00.000Z  DEBUG  dht/provider  sent provider record  {"prefix": "0010", "keys": ["EiD..."]}
//! ```
//!
//! Logs are interleaved by concurrent writers, so anything that does not decode
//! is dropped quietly.

use crate::config::PROVIDE_MARKER;
use crate::error::{Result, VerifyError};
use crate::identifier::Identifier;
use serde::Deserialize;
use tracing::trace;

/// Prefix recorded when the payload carries none.
pub const UNKNOWN_PREFIX: &str = "?";

/// One parsed provider-record event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    /// Opaque DHT prefix label.
    pub prefix: String,
    /// Successfully decoded keys, in payload order.
    pub keys: Vec<Identifier>,
    /// Keys that were not valid base64.
    pub malformed_keys: usize,
}

impl ProviderRecord {
    /// Parse `line` using the default marker.
    pub fn parse(line: &str) -> Option<Self> {
        parse_line(line, PROVIDE_MARKER)
    }

    /// Number of keys in the payload, including undecodable ones.
    pub fn key_count(&self) -> usize {
        self.keys.len() + self.malformed_keys
    }
}

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    keys: Vec<String>,
}

/// Parse `line` if it contains `marker` followed by a decodable payload.
///
/// The payload is the JSON object starting at the first `{`; text after the
/// object is ignored.
pub fn parse_line(line: &str, marker: &str) -> Option<ProviderRecord> {
    if !line.contains(marker) {
        return None;
    }
    let payload = match decode_payload(line) {
        Ok(payload) => payload,
        Err(e) => {
            trace!("Ignoring line: {}", e);
            return None;
        }
    };

    let mut keys = Vec::with_capacity(payload.keys.len());
    let mut malformed_keys = 0;
    for key in &payload.keys {
        match Identifier::from_base64(key) {
            Ok(id) => keys.push(id),
            Err(e) => {
                trace!("Skipping key: {}", e);
                malformed_keys += 1;
            }
        }
    }

    Some(ProviderRecord {
        prefix: payload.prefix.unwrap_or_else(|| UNKNOWN_PREFIX.to_string()),
        keys,
        malformed_keys,
    })
}

/// Decode the first JSON object in `line`.
fn decode_payload(line: &str) -> Result<Payload> {
    let start = line
        .find('{')
        .ok_or_else(|| VerifyError::UnparseableLogLine("no JSON object".to_string()))?;
    match serde_json::Deserializer::from_str(&line[start..])
        .into_iter::<Payload>()
        .next()
    {
        Some(Ok(payload)) => Ok(payload),
        Some(Err(e)) => Err(VerifyError::UnparseableLogLine(e.to_string())),
        None => Err(VerifyError::UnparseableLogLine("empty payload".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> Identifier {
        Identifier::from_bytes(vec![0x12, 0x20, byte, byte])
    }

    fn line(payload: &str) -> String {
        format!("2025-01-01T00:00:00.000Z\tDEBUG\tdht/provider\tsent provider record\t{payload}")
    }

    #[test]
    fn test_parses_prefix_and_keys_in_order() {
        let payload = format!(
            r#"{{"prefix": "0010", "keys": ["{}", "{}"]}}"#,
            id(1).to_base64(),
            id(2).to_base64()
        );
        let record = ProviderRecord::parse(&line(&payload)).unwrap();
        assert_eq!(record.prefix, "0010");
        assert_eq!(record.keys, vec![id(1), id(2)]);
        assert_eq!(record.malformed_keys, 0);
    }

    #[test]
    fn test_lines_without_marker_are_ignored() {
        let payload = format!(r#"{{"prefix": "0", "keys": ["{}"]}}"#, id(1).to_base64());
        assert!(ProviderRecord::parse(&format!("DEBUG dht reprovide {payload}")).is_none());
    }

    #[test]
    fn test_marker_without_payload_is_ignored() {
        assert!(ProviderRecord::parse("DEBUG sent provider record").is_none());
        assert!(ProviderRecord::parse("DEBUG sent provider record {\"keys\": [").is_none());
        assert!(ProviderRecord::parse("DEBUG sent provider record {\"keys\": 5}").is_none());
    }

    #[test]
    fn test_decode_failures_are_unparseable_lines() {
        for text in [
            "sent provider record",
            "sent provider record {\"keys\": [",
            "sent provider record {\"keys\": 5}",
        ] {
            let err = decode_payload(text).unwrap_err();
            assert!(matches!(err, VerifyError::UnparseableLogLine(_)), "{text}: {err:?}");
        }
        assert!(decode_payload("x {\"prefix\": \"1\"} y").is_ok());
    }

    #[test]
    fn test_missing_prefix_defaults() {
        let payload = format!(r#"{{"keys": ["{}"]}}"#, id(3).to_base64());
        let record = ProviderRecord::parse(&line(&payload)).unwrap();
        assert_eq!(record.prefix, UNKNOWN_PREFIX);
        assert_eq!(record.keys, vec![id(3)]);
    }

    #[test]
    fn test_bad_key_skipped_rest_kept() {
        let payload = format!(
            r#"{{"prefix": "1", "keys": ["%%%", "{}"]}}"#,
            id(4).to_base64()
        );
        let record = ProviderRecord::parse(&line(&payload)).unwrap();
        assert_eq!(record.keys, vec![id(4)]);
        assert_eq!(record.malformed_keys, 1);
        assert_eq!(record.key_count(), 2);
    }

    #[test]
    fn test_trailing_text_after_payload_is_ignored() {
        let payload = format!(
            r#"{{"prefix": "11", "keys": ["{}"], "count": 1}} caller=provider.go:120"#,
            id(5).to_base64()
        );
        let record = ProviderRecord::parse(&line(&payload)).unwrap();
        assert_eq!(record.prefix, "11");
        assert_eq!(record.keys, vec![id(5)]);
    }

    #[test]
    fn test_custom_marker() {
        let payload = format!(r#"{{"prefix": "", "keys": ["{}"]}}"#, id(6).to_base64());
        let text = format!("provide ok {payload}");
        assert!(parse_line(&text, "provide ok").is_some());
        assert!(parse_line(&text, PROVIDE_MARKER).is_none());
    }
}
