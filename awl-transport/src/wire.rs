//! Fixed-layout codec for the rendezvous wire protocol.
//!
//! Every datagram is exactly 64 bytes, zero padded; byte 0 is the message
//! kind. Per-kind layouts:
//!
//! - Register (0x01): byte 1 role flag; connectors append the target peer
//!   IPv4 (bytes 2..6), token length (byte 6), token.
//! - ConnectTo (0x02): peer IPv4 (bytes 1..5), anchor port little-endian
//!   (bytes 5..7), token length (byte 7), token.
//! - Punch (0x03) / PunchSuccess (0x04): token length (byte 1), token.
//! - Error (0x05): error code (byte 1).
//!
//! Addresses are four raw octets; the only multi-byte integer on the wire
//! (the anchor port) is little-endian.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut};
use thiserror::Error;

use awl_core::types::{PeerRole, SessionToken, MAX_TOKEN_LEN};

/// Fixed datagram size. Anything else on the wire is discarded.
pub const DATAGRAM_LEN: usize = 64;

/// Largest token length the raw reflection path will echo. Structured
/// decode is stricter and caps at [`MAX_TOKEN_LEN`].
pub const RAW_TOKEN_LIMIT: usize = 56;

/// Codec errors. All of them translate to a silent discard in the state
/// machine; they carry detail for debug logging only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram length {0}, expected {DATAGRAM_LEN}")]
    Length(usize),
    #[error("unknown message kind: {0:#04x}")]
    UnknownKind(u8),
    #[error("unknown role flag: {0}")]
    UnknownRole(u8),
    #[error("token length {0} out of range")]
    TokenLength(u8),
}

pub type WireResult<T> = Result<T, WireError>;

/// Message kinds carried in byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Client announcing itself to the rendezvous server.
    Register = 0x01,
    /// Server introduction naming the peer to punch towards.
    ConnectTo = 0x02,
    /// Peer-to-peer punch attempt.
    Punch = 0x03,
    /// Listener's acceptance echo of a punch.
    PunchSuccess = 0x04,
    /// Server-reported failure.
    Error = 0x05,
}

impl MessageKind {
    /// Map a raw kind byte; `None` for anything undefined.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::ConnectTo),
            0x03 => Some(Self::Punch),
            0x04 => Some(Self::PunchSuccess),
            0x05 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Role flag carried in a Register datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoleFlag {
    /// Peer initiating a connection.
    Connector = 1,
    /// Peer accepting connections.
    Listener = 2,
}

impl RoleFlag {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Connector),
            2 => Some(Self::Listener),
            _ => None,
        }
    }
}

impl From<PeerRole> for RoleFlag {
    fn from(role: PeerRole) -> Self {
        match role {
            PeerRole::Connector => Self::Connector,
            // Single-shot listeners register exactly like ordinary ones.
            PeerRole::Listener | PeerRole::ListenerSingle => Self::Listener,
        }
    }
}

/// Server-originated error codes. The enumeration is open ended; codes not
/// listed here are ignored by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// The requested peer is not registered with the server.
    ClientNotFound = 1,
}

impl ErrorCode {
    /// Map a raw code byte; `None` for codes this client does not action.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ClientNotFound),
            _ => None,
        }
    }
}

/// Structured view of one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Listener announcing itself to the rendezvous server.
    RegisterListener,
    /// Connector announcing itself, naming the listener it wants and the
    /// session token the server must forward.
    RegisterConnector {
        /// Public IPv4 of the listener to be introduced to.
        target: Ipv4Addr,
        /// Freshly generated session token.
        token: SessionToken,
    },
    /// Server introduction: punch towards `peer` around `anchor_port`.
    ConnectTo {
        /// Public IPv4 of the other peer.
        peer: Ipv4Addr,
        /// Base port for the prediction window.
        anchor_port: u16,
        /// Token forwarded from the connector's registration.
        token: SessionToken,
    },
    /// Peer-to-peer punch attempt.
    Punch {
        /// Session token carried for correlation.
        token: SessionToken,
    },
    /// Listener's acceptance echo of a punch.
    PunchSuccess {
        /// Token copied from the accepted punch.
        token: SessionToken,
    },
    /// Server-reported failure. The code stays raw so unknown values flow
    /// through to the dispatcher, which ignores them.
    Error {
        /// Raw error code byte.
        code: u8,
    },
}

impl Message {
    /// Kind byte this message serializes with.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::RegisterListener | Self::RegisterConnector { .. } => MessageKind::Register,
            Self::ConnectTo { .. } => MessageKind::ConnectTo,
            Self::Punch { .. } => MessageKind::Punch,
            Self::PunchSuccess { .. } => MessageKind::PunchSuccess,
            Self::Error { .. } => MessageKind::Error,
        }
    }

    /// Serialize into a fresh zeroed 64-byte datagram. Infallible: token
    /// validity is enforced at [`SessionToken`] construction.
    pub fn encode(&self) -> [u8; DATAGRAM_LEN] {
        let mut out = [0u8; DATAGRAM_LEN];
        let mut buf = &mut out[..];
        buf.put_u8(self.kind() as u8);
        match self {
            Self::RegisterListener => {
                buf.put_u8(RoleFlag::Listener as u8);
            }
            Self::RegisterConnector { target, token } => {
                buf.put_u8(RoleFlag::Connector as u8);
                buf.put_slice(&target.octets());
                buf.put_u8(token.len() as u8);
                buf.put_slice(token.as_bytes());
            }
            Self::ConnectTo {
                peer,
                anchor_port,
                token,
            } => {
                buf.put_slice(&peer.octets());
                buf.put_u16_le(*anchor_port);
                buf.put_u8(token.len() as u8);
                buf.put_slice(token.as_bytes());
            }
            Self::Punch { token } | Self::PunchSuccess { token } => {
                buf.put_u8(token.len() as u8);
                buf.put_slice(token.as_bytes());
            }
            Self::Error { code } => {
                buf.put_u8(*code);
            }
        }
        out
    }

    /// Parse a datagram. Anything that is not exactly 64 bytes, carries an
    /// undefined kind or role, or declares a token length outside 1..=32
    /// is rejected.
    pub fn decode(data: &[u8]) -> WireResult<Self> {
        if data.len() != DATAGRAM_LEN {
            return Err(WireError::Length(data.len()));
        }
        let mut buf = data;
        let kind = buf.get_u8();
        match MessageKind::from_u8(kind).ok_or(WireError::UnknownKind(kind))? {
            MessageKind::Register => {
                let role = buf.get_u8();
                match RoleFlag::from_u8(role).ok_or(WireError::UnknownRole(role))? {
                    RoleFlag::Listener => Ok(Self::RegisterListener),
                    RoleFlag::Connector => {
                        let target = get_ipv4(&mut buf);
                        let token = get_token(&mut buf)?;
                        Ok(Self::RegisterConnector { target, token })
                    }
                }
            }
            MessageKind::ConnectTo => {
                let peer = get_ipv4(&mut buf);
                let anchor_port = buf.get_u16_le();
                let token = get_token(&mut buf)?;
                Ok(Self::ConnectTo {
                    peer,
                    anchor_port,
                    token,
                })
            }
            MessageKind::Punch => Ok(Self::Punch {
                token: get_token(&mut buf)?,
            }),
            MessageKind::PunchSuccess => Ok(Self::PunchSuccess {
                token: get_token(&mut buf)?,
            }),
            MessageKind::Error => Ok(Self::Error {
                code: buf.get_u8(),
            }),
        }
    }
}

/// In-place listener echo: turn a received Punch into a PunchSuccess
/// leaving the token length and token bytes untouched. Accepts degenerate
/// zero-length tokens; rejects anything that is not a punch or whose
/// declared token would overflow the datagram. Returns whether the buffer
/// now holds an echo ready to send.
pub fn reflect_punch(buf: &mut [u8]) -> bool {
    if buf.len() != DATAGRAM_LEN || buf[0] != MessageKind::Punch as u8 {
        return false;
    }
    if buf[1] as usize > RAW_TOKEN_LIMIT {
        return false;
    }
    buf[0] = MessageKind::PunchSuccess as u8;
    true
}

fn get_ipv4(buf: &mut &[u8]) -> Ipv4Addr {
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    Ipv4Addr::from(octets)
}

// Offsets guarantee the token fits: the latest it can start is byte 8, and
// 8 + 32 <= 64.
fn get_token(buf: &mut &[u8]) -> WireResult<SessionToken> {
    let len = buf.get_u8();
    if len as usize == 0 || len as usize > MAX_TOKEN_LEN {
        return Err(WireError::TokenLength(len));
    }
    let mut bytes = [0u8; MAX_TOKEN_LEN];
    buf.copy_to_slice(&mut bytes[..len as usize]);
    SessionToken::from_bytes(&bytes[..len as usize]).map_err(|_| WireError::TokenLength(len))
}
