//! Periodic mission snapshots.
//!
//! While a session is connected the emitter re-broadcasts the mission-related
//! part of the shadow on a fixed interval, so observers can drive a progress
//! display without issuing reads.

use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::event::SessionEvent;
use crate::state::{DeviceShadow, Projection};

/// Property whose presence turns the snapshots on.
pub const MISSION_STATUS: &str = "cleanMissionStatus";

/// Properties carried by every snapshot.
pub const MISSION_PROPERTIES: [&str; 3] = [MISSION_STATUS, "pose", "bin"];

/// Snapshot of the mission properties, if a mission status is known.
pub fn mission_snapshot(shadow: &DeviceShadow) -> Option<Projection> {
    if shadow.get(MISSION_STATUS).is_none_or(|status| status.is_null()) {
        return None;
    }

    Some(
        MISSION_PROPERTIES
            .iter()
            .map(|property| (property.to_string(), shadow.get(property).cloned()))
            .collect(),
    )
}

/// Owns the repeating snapshot task.
pub struct MissionEmitter {
    shadow: watch::Receiver<DeviceShadow>,
    events: broadcast::Sender<SessionEvent>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl MissionEmitter {
    pub fn new(
        shadow: watch::Receiver<DeviceShadow>,
        events: broadcast::Sender<SessionEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            shadow,
            events,
            interval,
            task: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Start ticking; restarts the timer if it was already running.
    pub fn start(&mut self) {
        self.stop();

        let shadow = self.shadow.clone();
        let events = self.events.clone();
        let period = self.interval;

        self.task = Some(tokio::spawn(async move {
            // First tick lands one full period after start
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let snapshot = mission_snapshot(&shadow.borrow());
                if let Some(snapshot) = snapshot {
                    let _ = events.send(SessionEvent::Mission(snapshot));
                }
            }
        }));
        debug!("Mission emitter started (interval: {:?})", period);
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Mission emitter stopped");
        }
    }
}

impl Drop for MissionEmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shadow(reported: serde_json::Value) -> DeviceShadow {
        let mut shadow = DeviceShadow::new();
        shadow.merge_reported(reported.as_object().cloned().unwrap());
        shadow
    }

    #[test]
    fn test_snapshot_requires_mission_status() {
        assert!(mission_snapshot(&shadow(json!({"batPct": 50, "bin": {"full": false}}))).is_none());
        assert!(mission_snapshot(&shadow(json!({"cleanMissionStatus": null}))).is_none());
    }

    #[test]
    fn test_snapshot_contents() {
        let state = shadow(json!({
            "cleanMissionStatus": {"cycle": "clean", "phase": "run"},
            "bin": {"present": true, "full": false},
            "batPct": 64
        }));

        let snapshot = mission_snapshot(&state).unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(
            snapshot["cleanMissionStatus"],
            Some(json!({"cycle": "clean", "phase": "run"}))
        );
        assert_eq!(snapshot["pose"], None);
        assert!(!snapshot.contains_key("batPct"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_on_interval_and_stops() {
        let (state_tx, state_rx) = watch::channel(shadow(json!({
            "cleanMissionStatus": {"phase": "charge"}
        })));
        let (events, mut rx) = broadcast::channel(16);
        let mut emitter = MissionEmitter::new(state_rx, events, Duration::from_millis(800));

        emitter.start();
        assert!(emitter.is_running());

        tokio::time::sleep(Duration::from_millis(1700)).await;
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Mission(_))));
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Mission(_))));
        assert!(rx.try_recv().is_err());

        emitter.stop();
        assert!(!emitter.is_running());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        drop(state_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_without_mission_status() {
        let (_state_tx, state_rx) = watch::channel(shadow(json!({"batPct": 90})));
        let (events, mut rx) = broadcast::channel(16);
        let mut emitter = MissionEmitter::new(state_rx, events, Duration::from_millis(100));

        emitter.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }
}
