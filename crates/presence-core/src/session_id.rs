//! SessionId: the key of one participant's entry in the presence store.
//!
//! The transport hands one out per connection; the engine never invents ids
//! for remote participants, it only compares them and uses them as keys for
//! rendered overlays and style rules. Hosts see them as 16 lowercase hex
//! characters (the awareness client id, zero-padded), which keeps log lines,
//! change notices and CSS class names the same width.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Width of the textual form.
const HEX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionIdError {
    #[error("Session ID must be 16 hex characters, got {0}")]
    WrongLength(usize),
    #[error("Session ID {0:?} is not hexadecimal")]
    NotHex(String),
}

/// Key of a live presence session.
///
/// Ordered so per-session output (roster debugging, test assertions) can be
/// sorted deterministically.
///
/// # Examples
/// ```
/// use presence_core::SessionId;
///
/// let session: SessionId = "00000000000004d2".parse().unwrap();
/// assert_eq!(session.as_u64(), 1234);
/// assert_eq!(session.to_string(), "00000000000004d2");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// A fresh non-zero id, for transports that let the client pick one
    /// (the in-memory room, or a host without awareness client ids).
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        Self(rng.random_range(1..=u64::MAX))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$x}", self.0, width = HEX_LEN)
    }
}

impl FromStr for SessionId {
    type Err = SessionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HEX_LEN {
            return Err(SessionIdError::WrongLength(s.len()));
        }
        // from_str_radix alone would accept a leading '+'.
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SessionIdError::NotHex(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| SessionIdError::NotHex(s.to_string()))
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
