//! Reading the blid and password off a robot that is in pairing mode.
//!
//! * v2 robots answer a fixed 7-byte packet on the MQTT TLS port with a frame
//!   carrying the password.
//! * v1 robots expose `get passwd` on the `/umi` endpoint for a short while
//!   after the HOME button is held; until then they answer 401.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::tokio_rustls::rustls::pki_types::ServerName;
use rumqttc::tokio_rustls::TlsConnector;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_PORT;
use crate::error::{SdkError, SdkResult};
use crate::local_v1::{UmiClient, UmiMethod};
use crate::transport::tls;

/// Packet that asks a v2 robot for its password.
pub const HANDSHAKE_HEX: &str = "f005efcc3b2900";

/// Start of the password in a reply frame.
const PASSWORD_OFFSET: usize = 13;
/// Start of the password once the robot has sent a 2-byte header frame.
const SHORT_PASSWORD_OFFSET: usize = 9;

/// Frames this short carry no password.
const MIN_PASSWORD_FRAME: usize = 8;

/// v1 polling gives up when the request id reaches this value.
pub const V1_MAX_REQUEST_ID: u32 = 120;

pub const V1_RETRY_DELAY: Duration = Duration::from_secs(2);

/// What a frame from a v2 robot meant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Header frame; the password in the next frame starts earlier.
    ShortHeader,
    /// The robot refused; it is probably not in pairing mode.
    TooShort,
    Password(String),
}

/// Interprets the frames of a v2 password exchange.
#[derive(Debug, Clone)]
pub struct PasswordReader {
    offset: usize,
}

impl Default for PasswordReader {
    fn default() -> Self {
        Self {
            offset: PASSWORD_OFFSET,
        }
    }
}

impl PasswordReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, frame: &[u8]) -> FrameOutcome {
        if frame.len() == 2 {
            self.offset = SHORT_PASSWORD_OFFSET;
            return FrameOutcome::ShortHeader;
        }
        if frame.len() < MIN_PASSWORD_FRAME {
            return FrameOutcome::TooShort;
        }
        let password = frame.get(self.offset..).unwrap_or_default();
        FrameOutcome::Password(String::from_utf8_lossy(password).into_owned())
    }
}

/// Fetch the password of a v2 robot at `host`.
pub async fn fetch_password_v2(host: &str, ciphers: &str, timeout: Duration) -> SdkResult<String> {
    tokio::time::timeout(timeout, exchange_v2(host, ciphers))
        .await
        .map_err(|_| SdkError::timeout(timeout))?
}

async fn exchange_v2(host: &str, ciphers: &str) -> SdkResult<String> {
    let handshake = hex::decode(HANDSHAKE_HEX)
        .map_err(|e| SdkError::Protocol(format!("Bad handshake packet: {}", e)))?;
    let server_name = ServerName::try_from(host)
        .map_err(|e| SdkError::Configuration(format!("Invalid robot address '{}': {}", host, e)))?
        .to_owned();

    let connector = TlsConnector::from(Arc::new(tls::client_config(ciphers)?));
    let tcp = TcpStream::connect((host, DEFAULT_PORT))
        .await
        .map_err(|e| SdkError::Connection(format!("{}:{}: {}", host, DEFAULT_PORT, e)))?;
    let mut stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| SdkError::Connection(format!("TLS handshake with {} failed: {}", host, e)))?;

    stream.write_all(&handshake).await?;
    debug!("Password request sent to {}", host);

    let mut reader = PasswordReader::new();
    let mut buf = vec![0u8; 1024];
    loop {
        let len = stream.read(&mut buf).await?;
        if len == 0 {
            return Err(SdkError::Protocol(
                "Robot closed the connection without sending a password".to_string(),
            ));
        }
        match reader.feed(&buf[..len]) {
            FrameOutcome::ShortHeader => continue,
            FrameOutcome::TooShort => {
                return Err(SdkError::Protocol(
                    "Error getting password. Follow the instructions and try again.".to_string(),
                ))
            }
            FrameOutcome::Password(password) => {
                let _ = stream.shutdown().await;
                return Ok(password);
            }
        }
    }
}

/// Blid and password of a v1 robot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1Credentials {
    pub blid: String,
    pub password: String,
}

/// Render the `ok.blid` byte array of a `sys` answer as upper-case hex.
pub fn blid_from_sys(response: &Value) -> SdkResult<String> {
    let bytes = response["ok"]["blid"]
        .as_array()
        .ok_or_else(|| SdkError::Protocol("sys answer carries no blid".to_string()))?
        .iter()
        .map(|byte| {
            byte.as_u64()
                .map(|value| (value & 0xff) as u8)
                .ok_or_else(|| SdkError::Protocol(format!("Invalid blid byte: {}", byte)))
        })
        .collect::<SdkResult<Vec<u8>>>()?;
    Ok(hex::encode_upper(bytes))
}

/// Poll a v1 robot until it hands out its password, then read its blid.
pub async fn fetch_password_v1(host: &str, timeout: Duration) -> SdkResult<V1Credentials> {
    let anonymous = UmiClient::new(host, None, timeout)?;

    let mut id = 1;
    let password = loop {
        if id >= V1_MAX_REQUEST_ID {
            return Err(SdkError::timeout(V1_RETRY_DELAY * (V1_MAX_REQUEST_ID - 1)));
        }

        let response = anonymous
            .send(UmiMethod::Get, "passwd", None, id)
            .await
            .map_err(|e| SdkError::Connection(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            let body: Value = serde_json::from_str(&response.text().await?)?;
            let password = body["ok"]["passwd"]
                .as_str()
                .ok_or_else(|| {
                    SdkError::Protocol("passwd answer carries no password".to_string())
                })?;
            break password.to_string();
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            debug!("Robot not in pairing mode yet (request {})", id);
        } else {
            warn!("Unexpected status {} from robot, checking again", status);
        }
        tokio::time::sleep(V1_RETRY_DELAY).await;
        id += 1;
    };
    info!("Password received from {}", host);

    let authorized = UmiClient::new(host, Some(&password), timeout)?;
    let response = authorized.send(UmiMethod::Get, "sys", None, id + 1).await?;
    if !response.status().is_success() {
        return Err(SdkError::Protocol(format!(
            "Unexpected status {} getting the blid",
            response.status()
        )));
    }
    let body: Value = serde_json::from_str(&response.text().await?)?;

    Ok(V1Credentials {
        blid: blid_from_sys(&body)?,
        password,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame_with_password(offset: usize, password: &str) -> Vec<u8> {
        let mut frame = vec![0xf0; offset];
        frame.extend_from_slice(password.as_bytes());
        frame
    }

    #[test]
    fn test_handshake_packet() {
        assert_eq!(
            hex::decode(HANDSHAKE_HEX).unwrap(),
            vec![0xf0, 0x05, 0xef, 0xcc, 0x3b, 0x29, 0x00]
        );
    }

    #[test]
    fn test_password_at_default_offset() {
        let mut reader = PasswordReader::new();
        assert_eq!(
            reader.feed(&frame_with_password(13, ":1:1486937829:gOizXDDs0aD2Aoew")),
            FrameOutcome::Password(":1:1486937829:gOizXDDs0aD2Aoew".to_string())
        );
    }

    #[test]
    fn test_short_header_moves_offset() {
        let mut reader = PasswordReader::new();
        assert_eq!(reader.feed(&[0xf0, 0x23]), FrameOutcome::ShortHeader);
        assert_eq!(
            reader.feed(&frame_with_password(9, "secret-pass")),
            FrameOutcome::Password("secret-pass".to_string())
        );
    }

    #[test]
    fn test_short_frames_are_refusals() {
        let mut reader = PasswordReader::new();
        assert_eq!(
            reader.feed(&[0xf0, 0x05, 0xef, 0xcc, 0x3b, 0x29, 0x03]),
            FrameOutcome::TooShort
        );
        assert_eq!(reader.feed(&[0x01]), FrameOutcome::TooShort);
    }

    #[test]
    fn test_blid_from_sys() {
        let response = json!({"ok": {"blid": [49, 230, 10, 255, 256 + 1]}});
        assert_eq!(blid_from_sys(&response).unwrap(), "31E60AFF01");

        assert!(blid_from_sys(&json!({"ok": {}})).is_err());
        assert!(blid_from_sys(&json!({"ok": {"blid": ["x"]}})).is_err());
    }
}
