//! Compact flow and step identifiers.
//!
//! An [`Id`] is 96 bits of randomness. The high bit of the first byte marks a
//! *flow id* (one per workflow); step ids (one per suspension point) never
//! carry it. The text form is 16 characters of unpadded URL-safe base64, which
//! makes ids usable verbatim as store keys and in callback URLs.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{FlowError, FlowResult};

/// Length of the binary form in bytes.
pub const ID_BYTES: usize = 12;

/// Length of the text form in characters.
pub const ID_TEXT_LEN: usize = 16;

const FLOW_BIT: u8 = 0x80;

/// Identifier of a flow or of a single suspension point within a flow.
///
/// Ids are plain values: `Copy`, hashable and ordered by their bytes. They are
/// never all-zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; ID_BYTES]);

impl Id {
    /// Generate a new flow id (flow bit set).
    pub fn new_flow() -> Self {
        Self::generate(true)
    }

    /// Generate a new step id (flow bit clear).
    pub fn new_step() -> Self {
        Self::generate(false)
    }

    fn generate(flow: bool) -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; ID_BYTES];
            rng.fill_bytes(&mut bytes);
            if flow {
                bytes[0] |= FLOW_BIT;
            } else {
                bytes[0] &= !FLOW_BIT;
            }
            // Only reachable for step ids, and only with probability 2^-95.
            if bytes.iter().any(|b| *b != 0) {
                return Self(bytes);
            }
        }
    }

    /// Whether this id names a whole flow rather than a step.
    pub fn is_flow(&self) -> bool {
        self.0[0] & FLOW_BIT != 0
    }

    /// Whether this id names a suspension point.
    pub fn is_step(&self) -> bool {
        !self.is_flow()
    }

    /// Parse the 16-character text form.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidId`] on a wrong length, a character outside
    /// the URL-safe base64 alphabet, or the all-zero value.
    pub fn parse(text: &str) -> FlowResult<Self> {
        if text.len() != ID_TEXT_LEN {
            return Err(FlowError::InvalidId {
                input: text.to_string(),
                reason: format!("expected {ID_TEXT_LEN} characters, got {}", text.len()),
            });
        }
        let decoded = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|e| FlowError::InvalidId {
                input: text.to_string(),
                reason: e.to_string(),
            })?;
        Self::from_slice(&decoded).map_err(|_| FlowError::InvalidId {
            input: text.to_string(),
            reason: "decoded value is not a valid id".to_string(),
        })
    }

    /// Parse the text form, returning `None` instead of an error.
    pub fn try_parse(text: &str) -> Option<Self> {
        Self::parse(text).ok()
    }

    /// Rebuild an id from its 12-byte binary form.
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> FlowResult<Self> {
        if bytes.iter().all(|b| *b == 0) {
            return Err(FlowError::InvalidId {
                input: format!("{bytes:?}"),
                reason: "id must not be all-zero".to_string(),
            });
        }
        Ok(Self(bytes))
    }

    /// Rebuild an id from a byte slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> FlowResult<Self> {
        let array: [u8; ID_BYTES] = bytes.try_into().map_err(|_| FlowError::InvalidId {
            input: format!("{bytes:?}"),
            reason: format!("expected {ID_BYTES} bytes, got {}", bytes.len()),
        })?;
        Self::from_bytes(array)
    }

    /// The 12-byte binary form.
    pub fn to_bytes(&self) -> [u8; ID_BYTES] {
        self.0
    }

    /// Borrow the binary form.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_flow() { "flow" } else { "step" };
        write!(f, "Id({kind}:{self})")
    }
}

impl FromStr for Id {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}
