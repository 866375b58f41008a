//! Session configuration. Parses a TOML file into a strongly-typed structure.
//! Values are snapshotted when a session starts; editing the file has no
//! effect on sessions already running.

use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::error::{Error, Result};

/// Tunables for one punching session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PuncherConfig {
    /// Size of the port-prediction window. Bursts cover
    /// `anchor..anchor + port_predictions` ascending.
    pub port_predictions: u16,

    /// Outer punch attempts per ConnectTo (burst + listen cycles).
    pub max_punch_attempts: u32,

    /// Sleep between punch attempts in milliseconds. Zero means
    /// back-to-back bursts.
    pub retry_delay_ms: u64,

    /// Connector's per-attempt inbound wait budget in milliseconds.
    pub max_response_wait_ms: u64,

    /// Connector's bound on consumed inbound datagrams (or receive
    /// timeouts) before giving up on the rendezvous server.
    pub max_server_response_attempts: u32,

    /// Per-datagram send timeout in milliseconds.
    pub send_timeout_ms: u64,

    /// Inner receive poll in milliseconds. Bounds how quickly a session
    /// observes cancellation.
    pub listen_poll_ms: u64,
}

impl Default for PuncherConfig {
    fn default() -> Self {
        Self {
            port_predictions: 8,
            max_punch_attempts: 8,
            retry_delay_ms: 1000,
            max_response_wait_ms: 5000,
            max_server_response_attempts: 20,
            send_timeout_ms: 5000,
            listen_poll_ms: 1000,
        }
    }
}

impl PuncherConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path)
            .map_err(|e| Error::config(format!("{}: {e}", path.as_ref().display())))?;
        let cfg = toml::from_str::<PuncherConfig>(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the state machine cannot make progress with.
    pub fn validate(&self) -> Result<()> {
        if self.port_predictions == 0 {
            return Err(Error::config("port_predictions must be at least 1"));
        }
        if self.max_punch_attempts == 0 {
            return Err(Error::config("max_punch_attempts must be at least 1"));
        }
        if self.max_server_response_attempts == 0 {
            return Err(Error::config(
                "max_server_response_attempts must be at least 1",
            ));
        }
        if self.max_response_wait_ms == 0 {
            return Err(Error::config("max_response_wait_ms must be at least 1"));
        }
        if self.send_timeout_ms == 0 {
            return Err(Error::config("send_timeout_ms must be at least 1"));
        }
        if self.listen_poll_ms == 0 {
            return Err(Error::config("listen_poll_ms must be at least 1"));
        }
        Ok(())
    }

    /// Inter-attempt sleep as a Duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Per-attempt inbound wait budget as a Duration.
    pub fn response_wait(&self) -> Duration {
        Duration::from_millis(self.max_response_wait_ms)
    }

    /// Per-datagram send timeout as a Duration.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Inner receive poll as a Duration.
    pub fn listen_poll(&self) -> Duration {
        Duration::from_millis(self.listen_poll_ms)
    }
}
