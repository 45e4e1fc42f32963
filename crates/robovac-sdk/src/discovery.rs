//! Robot discovery over UDP.
//!
//! Robots answer the `irobotmcs` probe on port 5678 with a JSON document
//! describing themselves; the blid is the suffix of their `hostname`.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::{SdkError, SdkResult};

pub const DISCOVERY_PORT: u16 = 5678;

pub const PROBE: &[u8] = b"irobotmcs";

/// Hostname prefixes used by supported robots.
pub const BRANDS: [&str; 2] = ["Roomba", "iRobot"];

pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_DATAGRAM: usize = 2048;

/// Public information a robot announces.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotInfo {
    pub hostname: String,
    pub ip: String,
    pub blid: String,
    /// Full response, with `blid` added
    pub document: Map<String, Value>,
}

impl RobotInfo {
    pub fn to_json(&self) -> Value {
        Value::Object(self.document.clone())
    }
}

/// Blid of a robot hostname such as `Roomba-3115850251687850`.
pub fn blid_from_hostname(hostname: &str) -> Option<&str> {
    let (brand, rest) = hostname.split_once('-')?;
    if !BRANDS.contains(&brand) {
        return None;
    }
    Some(rest.split('-').next().unwrap_or(rest))
}

/// Parse one response datagram.
///
/// Fails when the payload is not JSON; returns `None` for documents that do
/// not describe a supported robot.
pub fn parse_response(payload: &[u8]) -> SdkResult<Option<RobotInfo>> {
    let document: Value = serde_json::from_slice(payload)?;
    let Value::Object(mut document) = document else {
        return Ok(None);
    };

    let hostname = match document.get("hostname").and_then(Value::as_str) {
        Some(hostname) if !hostname.is_empty() => hostname.to_string(),
        _ => return Ok(None),
    };
    let ip = match document.get("ip").and_then(Value::as_str) {
        Some(ip) if !ip.is_empty() => ip.to_string(),
        _ => return Ok(None),
    };
    let Some(blid) = blid_from_hostname(&hostname).map(str::to_string) else {
        return Ok(None);
    };

    document.insert("blid".to_string(), Value::String(blid.clone()));
    Ok(Some(RobotInfo {
        hostname,
        ip,
        blid,
        document,
    }))
}

/// Broadcast a probe and return the first robot that answers.
pub async fn discover(timeout: Duration) -> SdkResult<RobotInfo> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT)).await?;
    socket.set_broadcast(true)?;

    info!("Looking for robots...");
    socket
        .send_to(PROBE, (Ipv4Addr::BROADCAST, DISCOVERY_PORT))
        .await?;

    let robot = within(timeout, listen(&socket)).await?;
    info!("Robot found with blid {}", robot.blid);
    Ok(robot)
}

/// Ask the robot at `ip` for its public information.
pub async fn robot_public_info(ip: &str, timeout: Duration) -> SdkResult<RobotInfo> {
    let target: Ipv4Addr = ip
        .parse()
        .map_err(|_| SdkError::Configuration(format!("Invalid robot address: {}", ip)))?;

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT)).await?;
    socket.send_to(PROBE, (target, DISCOVERY_PORT)).await?;

    within(timeout, listen(&socket)).await
}

async fn within<F>(timeout: Duration, future: F) -> SdkResult<RobotInfo>
where
    F: std::future::Future<Output = SdkResult<RobotInfo>>,
{
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| SdkError::timeout(timeout))?
}

/// Read datagrams until one describes a robot.
pub async fn listen(socket: &UdpSocket) -> SdkResult<RobotInfo> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from): (usize, SocketAddr) = socket.recv_from(&mut buf).await?;
        match parse_response(&buf[..len]) {
            Ok(Some(robot)) => return Ok(robot),
            Ok(None) => debug!("Ignoring discovery answer from {}", from),
            Err(e) => warn!("Error in discovery message from {}: {}", from, e),
        }
    }
}
