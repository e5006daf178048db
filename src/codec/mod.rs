//! Payload codec
//!
//! Builds the single [`Envelope`] exchanged per session and converts it to and
//! from the JSON wire shape carried on a channel:
//!
//! ```text
//! { "kind": "photo" | "pdf", "data": <base64>, "filename"?: string,
//!   "displayName"?: string, "createdAt": <ms since unix epoch> }
//! ```
//!
//! Binary payloads ride as standard base64 so they share one message with the
//! metadata. There is no chunking: a multi-megabyte document is one frame.

pub mod frame;

use crate::errors::PairingError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use frame::{read_frame, write_frame, FRAME_HEADER_LEN};

/// What an envelope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    /// A JPEG frame captured on the secondary device
    Photo,
    /// A rendered document shared by the primary device
    Document,
}

impl PayloadKind {
    /// Value of the `kind` field on the wire
    pub fn as_wire(&self) -> &'static str {
        match self {
            PayloadKind::Photo => "photo",
            PayloadKind::Document => "pdf",
        }
    }

    /// Parse the `kind` field; unknown variants are rejected
    pub fn from_wire(kind: &str) -> Result<Self, PairingError> {
        match kind {
            "photo" => Ok(PayloadKind::Photo),
            "pdf" => Ok(PayloadKind::Document),
            other => Err(PairingError::UnknownMessageType(format!(
                "unknown envelope kind '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// The one message exchanged per session. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    kind: PayloadKind,
    payload: Bytes,
    filename: Option<String>,
    display_name: Option<String>,
    created_at: DateTime<Utc>,
}

impl Envelope {
    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Consume the envelope and keep only the payload bytes
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    kind: String,
    data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    created_at: i64,
}

/// Build an envelope, stamping `createdAt` with the current time truncated to
/// the millisecond precision of the wire format.
pub fn encode(
    bytes: impl Into<Bytes>,
    kind: PayloadKind,
    filename: Option<String>,
    display_name: Option<String>,
) -> Envelope {
    let now = Utc::now();
    let created_at = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
    Envelope {
        kind,
        payload: bytes.into(),
        filename,
        display_name,
        created_at,
    }
}

/// Serialize an envelope to its JSON wire form
pub fn to_wire(envelope: &Envelope) -> Result<Vec<u8>, PairingError> {
    let wire = WireEnvelope {
        kind: envelope.kind.as_wire().to_string(),
        data: STANDARD.encode(&envelope.payload),
        filename: envelope.filename.clone(),
        display_name: envelope.display_name.clone(),
        created_at: envelope.created_at.timestamp_millis(),
    };
    serde_json::to_vec(&wire)
        .map_err(|e| PairingError::Encoding(format!("Failed to serialize envelope: {}", e)))
}

/// Parse and validate an envelope received from a channel.
///
/// Anything that is not a well-formed envelope of a known kind is rejected
/// with `UnknownMessageType`.
pub fn decode(raw: &[u8]) -> Result<Envelope, PairingError> {
    let wire: WireEnvelope = serde_json::from_slice(raw).map_err(|e| {
        PairingError::UnknownMessageType(format!("malformed envelope: {}", e))
    })?;

    let kind = PayloadKind::from_wire(&wire.kind)?;

    let payload = STANDARD.decode(wire.data.as_bytes()).map_err(|e| {
        PairingError::UnknownMessageType(format!("payload is not valid base64: {}", e))
    })?;

    let created_at = DateTime::from_timestamp_millis(wire.created_at).ok_or_else(|| {
        PairingError::UnknownMessageType(format!(
            "createdAt out of range: {}",
            wire.created_at
        ))
    })?;

    Ok(Envelope {
        kind,
        payload: Bytes::from(payload),
        filename: wire.filename,
        display_name: wire.display_name,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_stamps_created_at() {
        let before = Utc::now().timestamp_millis();
        let envelope = encode(vec![1u8, 2, 3], PayloadKind::Photo, None, None);
        let after = Utc::now().timestamp_millis();

        let stamped = envelope.created_at().timestamp_millis();
        assert!(stamped >= before && stamped <= after);
        assert_eq!(envelope.len(), 3);
    }

    #[test]
    fn test_wire_shape() {
        let envelope = encode(
            b"%PDF-1.7".to_vec(),
            PayloadKind::Document,
            Some("chart.pdf".to_string()),
            Some("Chart for bed 4".to_string()),
        );
        let wire = to_wire(&envelope).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&wire).unwrap();

        assert_eq!(value["kind"], "pdf");
        assert_eq!(value["data"], STANDARD.encode(b"%PDF-1.7"));
        assert_eq!(value["filename"], "chart.pdf");
        assert_eq!(value["displayName"], "Chart for bed 4");
        assert!(value["createdAt"].is_i64());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let envelope = encode(vec![0u8; 4], PayloadKind::Photo, None, None);
        let wire = String::from_utf8(to_wire(&envelope).unwrap()).unwrap();
        assert!(!wire.contains("filename"));
        assert!(!wire.contains("displayName"));
    }

    #[test]
    fn test_decode_preserves_fields() {
        let envelope = encode(
            vec![0xFF, 0xD8, 0xFF, 0xE0],
            PayloadKind::Photo,
            Some("wound.jpg".to_string()),
            None,
        );
        let decoded = decode(&to_wire(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let raw = br#"{"kind":"video","data":"AAAA","createdAt":0}"#;
        let err = decode(raw).unwrap_err();
        assert!(matches!(err, PairingError::UnknownMessageType(msg) if msg.contains("video")));
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let raw = br#"{"kind":"photo","data":"***","createdAt":0}"#;
        assert!(matches!(
            decode(raw),
            Err(PairingError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert!(matches!(
            decode(b"\x00\x01not json"),
            Err(PairingError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_kind() {
        let raw = br#"{"data":"AAAA","createdAt":0}"#;
        assert!(matches!(
            decode(raw),
            Err(PairingError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(PayloadKind::Photo.as_wire(), "photo");
        assert_eq!(PayloadKind::Document.as_wire(), "pdf");
        assert_eq!(PayloadKind::from_wire("pdf").unwrap(), PayloadKind::Document);
    }
}
