//! Command and delta envelopes and the dispatcher that publishes them.
//!
//! ## Envelope shapes
//!
//! ```text
//! cmd   → {"command": "start", "time": 1700000000, "initiator": "localApp", ...extra}
//! delta → {"state": {"carpetBoost": false, "vacHigh": false}}
//! ```
//!
//! Nothing correlates a reply to an envelope; a call succeeds once the
//! transport has written it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{SdkError, SdkResult};
use crate::transport::{Channel, Transport};

/// Initiator stamped on every command envelope.
pub const INITIATOR: &str = "localApp";

/// Actions published on the `cmd` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RobotCommand {
    Start,
    Clean,
    Pause,
    Stop,
    Resume,
    Dock,
    Evac,
    Train,
}

impl RobotCommand {
    pub const ALL: [RobotCommand; 8] = [
        Self::Start,
        Self::Clean,
        Self::Pause,
        Self::Stop,
        Self::Resume,
        Self::Dock,
        Self::Evac,
        Self::Train,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Clean => "clean",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Resume => "resume",
            Self::Dock => "dock",
            Self::Evac => "evac",
            Self::Train => "train",
        }
    }
}

impl fmt::Display for RobotCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RobotCommand {
    type Err = SdkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|command| command.as_str() == s)
            .ok_or_else(|| SdkError::Configuration(format!("Unknown command: {}", s)))
    }
}

/// Carpet boost modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarpetBoost {
    Auto,
    Performance,
    Eco,
}

/// Number of cleaning passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleaningPasses {
    Auto,
    One,
    Two,
}

/// Cleaning preferences with a fixed state patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    CarpetBoost(CarpetBoost),
    EdgeClean(bool),
    CleaningPasses(CleaningPasses),
    AlwaysFinish(bool),
}

impl Preference {
    /// State patch sent on the `delta` channel.
    pub fn patch(&self) -> Value {
        match self {
            Self::CarpetBoost(CarpetBoost::Auto) => json!({"carpetBoost": true, "vacHigh": false}),
            Self::CarpetBoost(CarpetBoost::Performance) => {
                json!({"carpetBoost": false, "vacHigh": true})
            }
            Self::CarpetBoost(CarpetBoost::Eco) => json!({"carpetBoost": false, "vacHigh": false}),
            Self::EdgeClean(on) => json!({"openOnly": !on}),
            Self::CleaningPasses(CleaningPasses::Auto) => {
                json!({"noAutoPasses": false, "twoPass": false})
            }
            Self::CleaningPasses(CleaningPasses::One) => {
                json!({"noAutoPasses": true, "twoPass": false})
            }
            Self::CleaningPasses(CleaningPasses::Two) => {
                json!({"noAutoPasses": true, "twoPass": true})
            }
            Self::AlwaysFinish(on) => json!({"binPause": !on}),
        }
    }
}

/// Acknowledgement returned by every command; serializes as `{"ok": null}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub ok: (),
}

impl Ack {
    pub const OK: Ack = Ack { ok: () };
}

/// Outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Command(Map<String, Value>),
    Delta(Value),
}

impl Envelope {
    /// Command envelope; `extra` is merged after the base fields and wins on
    /// key collisions.
    pub fn command(command: RobotCommand, time: i64, extra: Option<Map<String, Value>>) -> Self {
        let mut body = Map::new();
        body.insert("command".to_string(), json!(command.as_str()));
        body.insert("time".to_string(), json!(time));
        body.insert("initiator".to_string(), json!(INITIATOR));
        if let Some(extra) = extra {
            body.extend(extra);
        }
        Self::Command(body)
    }

    pub fn delta(patch: Value) -> Self {
        Self::Delta(patch)
    }

    pub fn channel(&self) -> Channel {
        match self {
            Self::Command(_) => Channel::Cmd,
            Self::Delta(_) => Channel::Delta,
        }
    }

    pub fn body(&self) -> Value {
        match self {
            Self::Command(body) => Value::Object(body.clone()),
            Self::Delta(patch) => json!({ "state": patch }),
        }
    }

    pub fn to_payload(&self) -> SdkResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.body())?)
    }
}

/// Current unix time in whole seconds.
pub fn unix_time() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Publishes envelopes through a transport. No retries: a failed publish is
/// returned to the caller.
#[derive(Clone)]
pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
}

impl CommandDispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn dispatch(&self, envelope: Envelope) -> SdkResult<Ack> {
        let channel = envelope.channel();
        let payload = envelope.to_payload()?;
        debug!("Publishing {} bytes on {}", payload.len(), channel);
        self.transport.publish(channel, payload).await?;
        Ok(Ack::OK)
    }

    pub async fn command(&self, command: RobotCommand) -> SdkResult<Ack> {
        self.dispatch(Envelope::command(command, unix_time(), None))
            .await
    }

    pub async fn command_with(
        &self,
        command: RobotCommand,
        args: Map<String, Value>,
    ) -> SdkResult<Ack> {
        self.dispatch(Envelope::command(command, unix_time(), Some(args)))
            .await
    }

    pub async fn delta(&self, patch: Value) -> SdkResult<Ack> {
        self.dispatch(Envelope::delta(patch)).await
    }

    pub async fn preference(&self, preference: Preference) -> SdkResult<Ack> {
        self.delta(preference.patch()).await
    }
}
