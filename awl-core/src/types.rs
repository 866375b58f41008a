#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::fmt;

use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

/// Smallest token the wire protocol accepts.
pub const MIN_TOKEN_LEN: usize = 1;

/// Largest token the wire protocol accepts.
pub const MAX_TOKEN_LEN: usize = 32;

/// Length of locally generated session tokens.
pub const GENERATED_TOKEN_LEN: usize = 16;

/// Role a peer plays for the duration of one session. Chosen at invocation
/// time and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Initiates a connection towards a registered listener.
    Connector,
    /// Accepts connections until cancelled.
    Listener,
    /// Accepts exactly one connection, then terminates.
    ListenerSingle,
}

impl PeerRole {
    /// True for both listener variants.
    pub fn is_listener(self) -> bool {
        matches!(self, Self::Listener | Self::ListenerSingle)
    }

    /// True when the session should end after the first successful punch.
    pub fn is_single_shot(self) -> bool {
        matches!(self, Self::ListenerSingle)
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connector => write!(f, "connector"),
            Self::Listener => write!(f, "listener"),
            Self::ListenerSingle => write!(f, "listener-single"),
        }
    }
}

/// Per-session correlation token: 1 to 32 opaque bytes.
///
/// Connectors generate a fresh token per session from the OS RNG; listeners
/// echo whatever the rendezvous server forwards. Storage is a fixed
/// zero-padded array so equality can run in constant time over the whole
/// buffer regardless of the used length.
#[derive(Clone, Copy)]
pub struct SessionToken {
    bytes: [u8; MAX_TOKEN_LEN],
    len: u8,
}

impl SessionToken {
    /// Generate a fresh random token from the OS-backed CSPRNG.
    ///
    /// Unpredictability keeps unrelated or stale traffic from matching a
    /// live session.
    pub fn generate() -> Self {
        let mut bytes = [0u8; MAX_TOKEN_LEN];
        OsRng.fill_bytes(&mut bytes[..GENERATED_TOKEN_LEN]);
        Self {
            bytes,
            len: GENERATED_TOKEN_LEN as u8,
        }
    }

    /// Build a token from raw bytes. Length must be 1..=32.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() || data.len() > MAX_TOKEN_LEN {
            return Err(Error::token(format!(
                "length {} out of range {}..={}",
                data.len(),
                MIN_TOKEN_LEN,
                MAX_TOKEN_LEN
            )));
        }
        let mut bytes = [0u8; MAX_TOKEN_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self {
            bytes,
            len: data.len() as u8,
        })
    }

    /// The used portion of the token.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Number of used bytes (1..=32).
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Always false; construction rejects empty tokens.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hex rendering for logs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

// Constant-time comparison over the full padded buffer plus the length byte.
impl PartialEq for SessionToken {
    fn eq(&self, other: &Self) -> bool {
        (self.bytes.ct_eq(&other.bytes) & self.len.ct_eq(&other.len)).into()
    }
}

impl Eq for SessionToken {}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({})", self.to_hex())
    }
}
