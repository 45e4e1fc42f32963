//! Local v2 client: MQTT session, device shadow, reads and commands.
//!
//! ## Architecture
//!
//! ```text
//!  Transport ──events──▶ session driver ──▶ StateReconciler ──watch──▶ ReadResolver
//!      ▲                      │                    │
//!      │                      ▼                    ▼
//!  CommandDispatcher    MissionEmitter       SessionEvent broadcast
//! ```
//!
//! The driver task is the only writer of the shadow. Reads and commands run
//! independently of each other and of the driver.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::command::{Ack, CarpetBoost, CleaningPasses, CommandDispatcher, Preference, RobotCommand};
use crate::config::LocalConfig;
use crate::error::SdkResult;
use crate::event::{SessionEvent, EVENT_CHANNEL_CAPACITY};
use crate::mission::MissionEmitter;
use crate::resolver::{ReadOptions, ReadResolver, Reading};
use crate::state::{DeviceShadow, StateReconciler};
use crate::transport::{Transport, TransportEvent};

/// Properties behind [`LocalV2Client::get_sys`].
pub const SYS_PROPERTIES: [&str; 14] = [
    "bbrstinfo",
    "cap",
    "sku",
    "batteryType",
    "soundVer",
    "uiSwVer",
    "navSwVer",
    "wifiSwVer",
    "mobilityVer",
    "bootloaderVer",
    "umiVer",
    "softwareVer",
    "audio",
    "bin",
];

/// Properties behind [`LocalV2Client::get_preferences`].
pub const PREFERENCE_PROPERTIES: [&str; 5] =
    ["cleanMissionStatus", "cleanSchedule", "name", "vacHigh", "signal"];

/// Properties behind [`LocalV2Client::get_mission`].
pub const MISSION_READ_PROPERTIES: [&str; 4] = ["cleanMissionStatus", "pose", "bin", "batPct"];

/// Properties behind [`LocalV2Client::get_basic_mission`].
pub const BASIC_MISSION_PROPERTIES: [&str; 3] = ["cleanMissionStatus", "bin", "batPct"];

/// Client for one robot speaking the v2 protocol.
pub struct LocalV2Client {
    transport: Arc<dyn Transport>,
    dispatcher: CommandDispatcher,
    resolver: ReadResolver,
    events: broadcast::Sender<SessionEvent>,
    driver: JoinHandle<()>,
}

impl LocalV2Client {
    /// Open the MQTT/TLS session and start tracking the robot's state.
    #[cfg(feature = "mqtt")]
    pub async fn connect(config: LocalConfig) -> SdkResult<Self> {
        let (transport, inbound) = crate::transport::MqttTransport::connect(&config).await?;
        Ok(Self::with_transport(Arc::new(transport), inbound, &config))
    }

    /// Wire a session around an already established transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<TransportEvent>,
        config: &LocalConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let reconciler = StateReconciler::new(events.clone());
        let resolver = ReadResolver::new(reconciler.subscribe()).with_options(ReadOptions {
            timeout: config.read_timeout(),
        });
        let emitter = MissionEmitter::new(
            reconciler.subscribe(),
            events.clone(),
            config.emit_interval(),
        );

        let driver = tokio::spawn(drive_session(inbound, reconciler, emitter, events.clone()));

        Self {
            dispatcher: CommandDispatcher::new(transport.clone()),
            transport,
            resolver,
            events,
            driver,
        }
    }

    /// Observe session events (updates, state, mission snapshots, lifecycle).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current shadow, without waiting.
    pub fn shadow(&self) -> DeviceShadow {
        self.resolver.snapshot()
    }

    pub fn resolver(&self) -> &ReadResolver {
        &self.resolver
    }

    /// Whether the session driver is still processing transport events.
    pub fn is_active(&self) -> bool {
        !self.driver.is_finished()
    }

    /// Wait until the given properties are known.
    pub async fn wait_for(&self, required: &[&str], project_only: bool) -> SdkResult<Reading> {
        self.resolver.wait_for(required, project_only).await
    }

    pub async fn wait_for_with(
        &self,
        required: &[&str],
        project_only: bool,
        options: ReadOptions,
    ) -> SdkResult<Reading> {
        self.resolver
            .wait_for_with(required, project_only, options)
            .await
    }

    pub async fn get_time(&self) -> SdkResult<Reading> {
        self.wait_for(&["utctime"], true).await
    }

    pub async fn get_bbrun(&self) -> SdkResult<Reading> {
        self.wait_for(&["bbrun"], true).await
    }

    pub async fn get_langs(&self) -> SdkResult<Reading> {
        self.wait_for(&["langs"], true).await
    }

    pub async fn get_sys(&self) -> SdkResult<Reading> {
        self.wait_for(&SYS_PROPERTIES, true).await
    }

    pub async fn get_wireless_last_status(&self) -> SdkResult<Reading> {
        self.wait_for(&["wifistat", "wlcfg"], true).await
    }

    pub async fn get_week(&self) -> SdkResult<Reading> {
        self.wait_for(&["cleanSchedule"], true).await
    }

    /// Resolves with the whole document.
    pub async fn get_preferences(&self) -> SdkResult<Reading> {
        self.wait_for(&PREFERENCE_PROPERTIES, false).await
    }

    /// Resolves with the whole document once `fields` are known.
    pub async fn get_robot_state(&self, fields: &[&str]) -> SdkResult<Reading> {
        self.wait_for(fields, false).await
    }

    pub async fn get_mission(&self) -> SdkResult<Reading> {
        self.wait_for(&MISSION_READ_PROPERTIES, true).await
    }

    pub async fn get_basic_mission(&self) -> SdkResult<Reading> {
        self.wait_for(&BASIC_MISSION_PROPERTIES, true).await
    }

    pub async fn get_wireless_config(&self) -> SdkResult<Reading> {
        self.wait_for(&["wlcfg", "netinfo"], true).await
    }

    pub async fn get_wireless_status(&self) -> SdkResult<Reading> {
        self.wait_for(&["wifistat", "netinfo"], true).await
    }

    pub async fn get_cloud_config(&self) -> SdkResult<Reading> {
        self.wait_for(&["cloudEnv"], true).await
    }

    pub async fn get_sku(&self) -> SdkResult<Reading> {
        self.wait_for(&["sku"], true).await
    }

    pub async fn command(&self, command: RobotCommand) -> SdkResult<Ack> {
        self.dispatcher.command(command).await
    }

    pub async fn start(&self) -> SdkResult<Ack> {
        self.command(RobotCommand::Start).await
    }

    pub async fn clean(&self) -> SdkResult<Ack> {
        self.command(RobotCommand::Clean).await
    }

    /// Start a targeted mission; `args` (map id, regions, ...) are merged into
    /// the command envelope.
    pub async fn clean_room(&self, args: Map<String, Value>) -> SdkResult<Ack> {
        self.dispatcher.command_with(RobotCommand::Start, args).await
    }

    pub async fn pause(&self) -> SdkResult<Ack> {
        self.command(RobotCommand::Pause).await
    }

    pub async fn stop(&self) -> SdkResult<Ack> {
        self.command(RobotCommand::Stop).await
    }

    pub async fn resume(&self) -> SdkResult<Ack> {
        self.command(RobotCommand::Resume).await
    }

    pub async fn dock(&self) -> SdkResult<Ack> {
        self.command(RobotCommand::Dock).await
    }

    pub async fn evac(&self) -> SdkResult<Ack> {
        self.command(RobotCommand::Evac).await
    }

    pub async fn train(&self) -> SdkResult<Ack> {
        self.command(RobotCommand::Train).await
    }

    pub async fn set_week(&self, schedule: Value) -> SdkResult<Ack> {
        self.dispatcher
            .delta(json!({ "cleanSchedule": schedule }))
            .await
    }

    /// Send an arbitrary state patch.
    pub async fn set_preferences(&self, patch: Value) -> SdkResult<Ack> {
        self.dispatcher.delta(patch).await
    }

    pub async fn set_preference(&self, preference: Preference) -> SdkResult<Ack> {
        self.dispatcher.preference(preference).await
    }

    pub async fn set_carpet_boost(&self, mode: CarpetBoost) -> SdkResult<Ack> {
        self.set_preference(Preference::CarpetBoost(mode)).await
    }

    pub async fn set_edge_clean(&self, on: bool) -> SdkResult<Ack> {
        self.set_preference(Preference::EdgeClean(on)).await
    }

    pub async fn set_cleaning_passes(&self, passes: CleaningPasses) -> SdkResult<Ack> {
        self.set_preference(Preference::CleaningPasses(passes)).await
    }

    pub async fn set_always_finish(&self, on: bool) -> SdkResult<Ack> {
        self.set_preference(Preference::AlwaysFinish(on)).await
    }

    /// Close the connection. Pending reads fail with `Closed` once the
    /// transport reports it.
    pub async fn disconnect(&self) -> SdkResult<()> {
        self.transport.disconnect().await
    }
}

impl Drop for LocalV2Client {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive_session(
    mut inbound: mpsc::Receiver<TransportEvent>,
    reconciler: StateReconciler,
    mut emitter: MissionEmitter,
    events: broadcast::Sender<SessionEvent>,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            TransportEvent::Connected => {
                info!("Robot session connected");
                emitter.start();
                let _ = events.send(SessionEvent::Connected);
            }
            TransportEvent::Frame(payload) => {
                reconciler.apply_frame(&payload);
            }
            TransportEvent::Error(message) => {
                error!("Robot session failed: {}", message);
                let _ = events.send(SessionEvent::Error(message));
            }
            TransportEvent::Closed => {
                info!("Robot session closed");
                emitter.stop();
                let _ = events.send(SessionEvent::Closed);
            }
        }
    }

    emitter.stop();
    debug!("Session driver finished");
}
