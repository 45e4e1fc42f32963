//! Transport seam between a session and the robot.
//!
//! A transport owns the connection. It accepts publishes on one of the two
//! outbound channels and reports everything else (handshake done, inbound
//! frames, errors, close) as [`TransportEvent`]s on an mpsc channel handed
//! out at construction.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SdkResult;

#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "mqtt")]
pub mod tls;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

/// Outbound topics understood by the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Action commands
    Cmd,
    /// State patches
    Delta,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cmd => "cmd",
            Self::Delta => "delta",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    /// Raw inbound payload
    Frame(Vec<u8>),
    /// Fatal error; a `Closed` follows
    Error(String),
    Closed,
}

/// Outbound half of a connection to one robot.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload. Resolves once the transport has written it.
    async fn publish(&self, channel: Channel, payload: Vec<u8>) -> SdkResult<()>;

    /// Close the connection; a `Closed` event follows.
    async fn disconnect(&self) -> SdkResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        assert_eq!(Channel::Cmd.as_str(), "cmd");
        assert_eq!(Channel::Delta.to_string(), "delta");
        assert_eq!(serde_json::to_string(&Channel::Delta).unwrap(), "\"delta\"");
    }
}
