//! Versioned encoding for everything that crosses a worker boundary.
//!
//! Jobs and replies travel as `{"version": WIRE_VERSION, "body": ...}` JSON.
//! A peer speaking another version is refused outright.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::WireError;

pub const WIRE_VERSION: u16 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    version: u16,
    body: &'a T,
}

/// The version was already checked through [`VersionOnly`].
#[derive(Deserialize)]
struct Envelope<T> {
    body: T,
}

#[derive(Deserialize)]
struct VersionOnly {
    version: u16,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(&EnvelopeRef {
        version: WIRE_VERSION,
        body: value,
    })
    .map_err(WireError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    // Check the version first so a newer body is reported as a version problem.
    let header: VersionOnly = serde_json::from_slice(bytes).map_err(WireError::Decode)?;
    if header.version != WIRE_VERSION {
        return Err(WireError::VersionMismatch {
            expected: WIRE_VERSION,
            found: header.version,
        });
    }

    let envelope: Envelope<T> = serde_json::from_slice(bytes).map_err(WireError::Decode)?;
    Ok(envelope.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn envelope_carries_version() {
        let bytes = encode(&Sample {
            name: "a".into(),
            count: 2,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["version"], WIRE_VERSION);
        assert_eq!(value["body"]["count"], 2);

        let back: Sample = decode(&bytes).unwrap();
        assert_eq!(back.name, "a");
    }

    #[test]
    fn other_versions_are_rejected() {
        let bytes = br#"{"version": 99, "body": {"name": "a", "count": 1}}"#;
        match decode::<Sample>(bytes) {
            Err(WireError::VersionMismatch { expected, found }) => {
                assert_eq!(expected, WIRE_VERSION);
                assert_eq!(found, 99);
            }
            other => panic!("expected a version mismatch, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_fail_loudly() {
        let bytes = br#"{"version": 1, "body": {"name": "a", "count": 1, "extra": true}}"#;
        assert!(matches!(decode::<Sample>(bytes), Err(WireError::Decode(_))));
    }

    #[test]
    fn envelope_without_body_is_a_decode_error() {
        let bytes = format!(r#"{{"version": {WIRE_VERSION}}}"#);
        assert!(matches!(decode::<Sample>(bytes.as_bytes()), Err(WireError::Decode(_))));
    }

    #[test]
    fn envelope_without_version_is_a_decode_error() {
        let bytes = br#"{"body": {"name": "a", "count": 1}}"#;
        assert!(matches!(decode::<Sample>(bytes), Err(WireError::Decode(_))));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(decode::<Sample>(b"not json"), Err(WireError::Decode(_))));
    }
}
