use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failures that cross the public session boundary.
///
/// Wire-level noise never lands here: malformed datagrams, wrong senders
/// and mismatched tokens are dropped inside the state machine with at most
/// a debug log. What remains is the socket failing underneath a session,
/// a session driving a transport that was already released, a rejected
/// configuration, or token material no datagram could carry.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket bind, send, or receive failed underneath the session.
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
    /// The transport was released while a session still held it.
    #[error("transport closed")]
    Closed,
    /// A tunable failed validation or the configuration file was
    /// unreadable.
    #[error("config: {0}")]
    Config(String),
    /// Token material outside what a datagram can carry.
    #[error("token: {0}")]
    Token(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn token(msg: impl Into<String>) -> Self {
        Self::Token(msg.into())
    }
}

// TOML parse failures belong to the config domain alongside validation.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
