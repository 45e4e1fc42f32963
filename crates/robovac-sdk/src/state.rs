//! Device shadow and the reconciler that feeds it.
//!
//! The shadow is the last known reported state of one robot: a flat document
//! of top-level properties plus the capability set copied out of `cap`. Only
//! the [`StateReconciler`] writes to it; everybody else reads snapshots through
//! a `watch` receiver and is woken whenever a merge happens.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::capability::CapabilitySet;
use crate::error::SdkResult;
use crate::event::SessionEvent;

/// Property name to reported value.
pub type StateDocument = Map<String, Value>;

/// Requested properties with their value, `None` when the robot lacks the
/// capability or the property is not reported.
pub type Projection = BTreeMap<String, Option<Value>>;

/// Property holding the capability set.
pub const CAPABILITY_PROPERTY: &str = "cap";

/// In-memory shadow of one robot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceShadow {
    document: StateDocument,
    capabilities: Option<CapabilitySet>,
}

impl DeviceShadow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self) -> &StateDocument {
        &self.document
    }

    /// `None` until the robot has reported `cap`.
    pub fn capabilities(&self) -> Option<&CapabilitySet> {
        self.capabilities.as_ref()
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.document.get(property)
    }

    pub fn contains(&self, property: &str) -> bool {
        self.document.contains_key(property)
    }

    /// Shallow merge: every top-level key of the fragment replaces the
    /// previous value wholesale.
    pub fn merge_reported(&mut self, fragment: StateDocument) {
        for (property, value) in fragment {
            self.document.insert(property, value);
        }

        // A `cap` that is not an object still replaces the previous set
        if let Some(reported) = self.document.get(CAPABILITY_PROPERTY) {
            self.capabilities = Some(CapabilitySet::from_reported(reported).unwrap_or_default());
        }
    }
}

#[derive(Deserialize)]
struct InboundFrame {
    state: ReportedSection,
}

#[derive(Deserialize)]
struct ReportedSection {
    #[serde(default)]
    reported: Option<StateDocument>,
}

/// Parse a raw frame into the full message and its reported fragment.
pub fn parse_frame(payload: &[u8]) -> SdkResult<(Value, Option<StateDocument>)> {
    let message: Value = serde_json::from_slice(payload)?;
    let frame = InboundFrame::deserialize(&message)?;
    Ok((message, frame.state.reported))
}

/// Single writer of a [`DeviceShadow`].
pub struct StateReconciler {
    shadow: watch::Sender<DeviceShadow>,
    events: broadcast::Sender<SessionEvent>,
}

impl StateReconciler {
    pub fn new(events: broadcast::Sender<SessionEvent>) -> Self {
        let (shadow, _) = watch::channel(DeviceShadow::new());
        Self { shadow, events }
    }

    /// Receiver that observes every merge.
    pub fn subscribe(&self) -> watch::Receiver<DeviceShadow> {
        self.shadow.subscribe()
    }

    pub fn snapshot(&self) -> DeviceShadow {
        self.shadow.borrow().clone()
    }

    /// Merge one inbound frame. Malformed frames are logged and dropped
    /// without touching the shadow or notifying anyone.
    ///
    /// Returns whether the frame was accepted.
    pub fn apply_frame(&self, payload: &[u8]) -> bool {
        let (message, reported) = match parse_frame(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Error in packet response: {}", e);
                return false;
            }
        };

        if let Some(fragment) = reported {
            debug!("Merging {} reported properties", fragment.len());
            self.shadow.send_modify(|shadow| shadow.merge_reported(fragment));
        }

        if self.events.receiver_count() > 0 {
            let document = self.shadow.borrow().document().clone();
            let _ = self.events.send(SessionEvent::Update(message));
            let _ = self.events.send(SessionEvent::State(document));
        }

        true
    }
}
