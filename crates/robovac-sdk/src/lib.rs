//! Local-control SDK for robotic vacuums.
//!
//! Two local protocols are supported:
//!
//! - **v2**: an MQTT session over TLS on port 8883. The robot streams
//!   reported-state fragments that are merged into a per-session
//!   [`DeviceShadow`]; reads wait until the properties they need are known.
//! - **v1**: JSON requests over HTTPS to the robot's `/umi` endpoint.
//!
//! Robots can be found with [`discovery::discover`], and their credentials
//! read with the functions in [`password`].
//!
//! ```no_run
//! use robovac_sdk::{LocalConfig, LocalV2Client};
//!
//! # async fn run() -> robovac_sdk::SdkResult<()> {
//! let config = LocalConfig::new(
//!     "3115850251687850",
//!     ":1:1486937829:gOizXDDs0aD2Aoew",
//!     "192.168.1.104",
//! );
//! let robot = LocalV2Client::connect(config).await?;
//! let battery = robot.wait_for(&["batPct"], true).await?;
//! println!("battery: {}", battery.into_json());
//! robot.dock().await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

pub mod capability;
pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
#[cfg(feature = "http")]
pub mod local_v1;
pub mod local_v2;
pub mod mission;
#[cfg(all(feature = "mqtt", feature = "http"))]
pub mod password;
pub mod resolver;
pub mod state;
pub mod transport;

pub use capability::{CapabilitySet, OptionalCapability};
pub use command::{
    Ack, CarpetBoost, CleaningPasses, CommandDispatcher, Envelope, Preference, RobotCommand,
};
pub use config::LocalConfig;
pub use discovery::RobotInfo;
pub use error::{SdkError, SdkResult};
pub use event::SessionEvent;
#[cfg(feature = "http")]
pub use local_v1::LocalV1Client;
pub use local_v2::LocalV2Client;
pub use resolver::{ReadOptions, ReadResolver, Reading};
pub use state::{DeviceShadow, Projection, StateDocument};
pub use transport::{Channel, Transport, TransportEvent};

/// Local protocol generation spoken by a robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    V1,
    #[default]
    V2,
}

impl std::str::FromStr for ProtocolVersion {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches(['v', 'V']) {
            "1" => Ok(Self::V1),
            "2" => Ok(Self::V2),
            _ => Err(SdkError::Configuration(format!(
                "Unknown protocol version: {}",
                s
            ))),
        }
    }
}

/// A local client of either protocol generation.
pub enum Local {
    #[cfg(feature = "http")]
    V1(LocalV1Client),
    V2(LocalV2Client),
}

impl Local {
    pub fn version(&self) -> ProtocolVersion {
        match self {
            #[cfg(feature = "http")]
            Self::V1(_) => ProtocolVersion::V1,
            Self::V2(_) => ProtocolVersion::V2,
        }
    }
}

/// Create a local client for `version`. v2 clients are connected before
/// this returns; v1 clients connect per request.
pub async fn local(config: LocalConfig, version: ProtocolVersion) -> SdkResult<Local> {
    match version {
        #[cfg(feature = "http")]
        ProtocolVersion::V1 => Ok(Local::V1(LocalV1Client::new(&config)?)),
        #[cfg(feature = "mqtt")]
        ProtocolVersion::V2 => Ok(Local::V2(LocalV2Client::connect(config).await?)),
        #[allow(unreachable_patterns)]
        other => Err(SdkError::Configuration(format!(
            "Protocol {:?} is not enabled in this build",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(ProtocolVersion::default(), ProtocolVersion::V2);
        assert_eq!("1".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V1);
        assert_eq!("v2".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V2);
        assert!("3".parse::<ProtocolVersion>().is_err());
    }

    #[tokio::test]
    async fn test_local_v1_validates_config() {
        let config = LocalConfig::new("", "secret", "192.168.1.20");
        let result = local(config, ProtocolVersion::V1).await;
        assert!(matches!(result, Err(SdkError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_local_v1_builds_without_network() {
        let config = LocalConfig::new("blid", "secret", "192.168.1.20");
        let client = local(config, ProtocolVersion::V1).await.unwrap();
        assert_eq!(client.version(), ProtocolVersion::V1);
    }
}
