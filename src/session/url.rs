//! Session ids and pairing URLs.
//!
//! A pairing URL is `<base>?<flag>=1&peer=<session id>` with the flag
//! `photo` or `pdf`. It is the only thing that crosses from the primary to
//! the secondary device.

use crate::codec::PayloadKind;
use crate::errors::PairingError;
use crate::transport::{is_valid_peer_id, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Query parameter carrying the session id
pub const PEER_PARAM: &str = "peer";

/// Identifier of one pairing attempt.
///
/// Generated ids are UUID v4 in simple form (32 hex characters, 122 random
/// bits). Uniqueness is probabilistic; nothing registers or reserves them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Accept an externally supplied id (1..=64 of `[A-Za-z0-9_-]`)
    pub fn parse(id: &str) -> Result<Self, PairingError> {
        if !is_valid_peer_id(id) {
            return Err(PairingError::InvalidPairingUrl(format!(
                "malformed session id '{}'",
                id
            )));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Broker identity the Responder registers under
    pub fn peer_id(&self) -> PeerId {
        // same alphabet as peer ids, checked at construction
        PeerId::new_unchecked(self.0.clone())
    }
}

impl TryFrom<String> for SessionId {
    type Error = PairingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        SessionId::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a session transfers, and in which direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    /// Secondary captures a photo and sends it to the primary
    Photo,
    /// Primary sends a document to the secondary
    Document,
}

impl SessionRole {
    /// Query flag naming the role in a pairing URL
    pub fn flag(&self) -> &'static str {
        match self {
            SessionRole::Photo => "photo",
            SessionRole::Document => "pdf",
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "photo" => Some(SessionRole::Photo),
            "pdf" => Some(SessionRole::Document),
            _ => None,
        }
    }

    /// Kind of the envelope exchanged in this role
    pub fn payload_kind(&self) -> PayloadKind {
        match self {
            SessionRole::Photo => PayloadKind::Photo,
            SessionRole::Document => PayloadKind::Document,
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag())
    }
}

/// URL the secondary device opens to join a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairingUrl(String);

impl PairingUrl {
    /// Append the role flag and session id to `base`, keeping any query it
    /// already carries. The base must be an absolute URL with a host and no
    /// fragment.
    pub fn build(base: &str, role: SessionRole, id: &SessionId) -> Result<Self, PairingError> {
        let mut url = parse_absolute(base)?;
        if url.fragment().is_some() {
            return Err(PairingError::InvalidPairingUrl(format!(
                "base URL '{}' carries a fragment",
                base
            )));
        }
        url.query_pairs_mut()
            .append_pair(role.flag(), "1")
            .append_pair(PEER_PARAM, id.as_str());
        Ok(Self(url.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PairingUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn parse_absolute(raw: &str) -> Result<Url, PairingError> {
    let url = Url::parse(raw)
        .map_err(|e| PairingError::InvalidPairingUrl(format!("'{}' is not a valid URL: {}", raw, e)))?;
    if url.host_str().is_none() {
        return Err(PairingError::InvalidPairingUrl(format!("'{}' has no host", raw)));
    }
    Ok(url)
}

/// Extract role and session id from a scanned pairing URL.
///
/// Exactly one role flag and exactly one `peer` parameter must be present.
/// A flag counts as set unless its value is `0` or `false`. Parameters are
/// percent-decoded before they are checked.
pub fn parse_pairing_url(url: &str) -> Result<(SessionRole, SessionId), PairingError> {
    let parsed = parse_absolute(url)?;

    let mut role: Option<SessionRole> = None;
    let mut peer: Option<String> = None;

    for (key, value) in parsed.query_pairs() {
        if key == PEER_PARAM {
            if peer.is_some() {
                return Err(PairingError::InvalidPairingUrl(
                    "duplicate peer parameter".to_string(),
                ));
            }
            peer = Some(value.into_owned());
            continue;
        }

        if let Some(flagged) = SessionRole::from_flag(&key) {
            if value == "0" || value.eq_ignore_ascii_case("false") {
                continue;
            }
            match role {
                Some(existing) if existing == flagged => {
                    return Err(PairingError::InvalidPairingUrl(format!(
                        "duplicate role flag '{}'",
                        key
                    )))
                }
                Some(existing) => {
                    return Err(PairingError::InvalidPairingUrl(format!(
                        "conflicting role flags '{}' and '{}'",
                        existing.flag(),
                        key
                    )))
                }
                None => role = Some(flagged),
            }
        }
    }

    let role = role.ok_or_else(|| {
        PairingError::InvalidPairingUrl("missing role flag (photo or pdf)".to_string())
    })?;
    let peer = peer.ok_or_else(|| {
        PairingError::InvalidPairingUrl("missing peer parameter".to_string())
    })?;

    Ok((role, SessionId::parse(&peer)?))
}
