//! Events broadcast by a local session to its observers.

use serde_json::Value;

use crate::state::{Projection, StateDocument};

/// Default capacity of a session's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Observer-facing session event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The transport finished its handshake
    Connected,

    /// A reported-state frame was merged; carries the full parsed message
    Update(Value),

    /// Document after the latest merge
    State(StateDocument),

    /// Periodic mission snapshot (`cleanMissionStatus`, `pose`, `bin`)
    Mission(Projection),

    /// The transport went away
    Closed,

    /// Fatal transport error, followed by `Closed`
    Error(String),
}

impl SessionEvent {
    /// Short name, handy for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Update(_) => "update",
            Self::State(_) => "state",
            Self::Mission(_) => "mission",
            Self::Closed => "closed",
            Self::Error(_) => "error",
        }
    }
}
