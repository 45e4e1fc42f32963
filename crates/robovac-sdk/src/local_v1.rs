//! Local v1 client: JSON requests over HTTPS to the robot's `/umi` endpoint.
//!
//! ```text
//! POST https://<host>:443/umi
//! {"do": "get", "args": ["prefs"], "id": 17}
//! {"do": "set", "args": ["cmd", {"op": "start"}], "id": 18}
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use base64::Engine;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::command::{CarpetBoost, CleaningPasses, Preference};
use crate::config::LocalConfig;
use crate::error::{SdkError, SdkResult};

/// HTTPS port of the v1 API.
pub const UMI_PORT: u16 = 443;

/// Request ids run from 1 up to this value and then wrap.
pub const MAX_REQUEST_ID: u32 = 1000;

const USER_AGENT: &str = "aspen%20production/2618 CFNetwork/758.3.15 Darwin/15.4.0";

/// `do` field of a v1 request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UmiMethod {
    Get,
    Set,
}

impl UmiMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
        }
    }
}

/// Request id following `current`.
pub fn next_request_id(current: u32) -> u32 {
    if current >= MAX_REQUEST_ID {
        1
    } else {
        current + 1
    }
}

/// JSON body of a v1 request.
pub fn request_body(method: UmiMethod, command: &str, args: Option<&Value>, id: u32) -> Value {
    let mut call_args = vec![json!(command)];
    if let Some(args) = args {
        call_args.push(args.clone());
    }
    json!({ "do": method, "args": call_args, "id": id })
}

/// Value of the `Authorization` header for a robot password.
pub fn basic_auth(password: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("user:{}", password));
    format!("Basic {}", token)
}

/// Headers sent with every request; `Authorization` only when a password is known.
pub fn default_headers(host: &str, password: Option<&str>) -> SdkResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("identity"));
    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-us"));
    headers.insert(
        header::HOST,
        HeaderValue::from_str(host)
            .map_err(|e| SdkError::Configuration(format!("Invalid host '{}': {}", host, e)))?,
    );
    if let Some(password) = password {
        let value = HeaderValue::from_str(&basic_auth(password))
            .map_err(|e| SdkError::Configuration(format!("Invalid password: {}", e)))?;
        headers.insert(header::AUTHORIZATION, value);
    }
    Ok(headers)
}

/// Low-level HTTPS client for the `/umi` endpoint.
pub struct UmiClient {
    http: reqwest::Client,
    url: String,
    last_id: AtomicU32,
}

impl UmiClient {
    /// Client for `host`. The robot's certificate is self-signed and is not
    /// validated.
    pub fn new(host: &str, password: Option<&str>, timeout: Duration) -> SdkResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .default_headers(default_headers(host, password)?)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| SdkError::Connection(e.to_string()))?;

        Ok(Self {
            http,
            url: format!("https://{}:{}/umi", host, UMI_PORT),
            last_id: AtomicU32::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Advance and return the request id.
    pub fn next_id(&self) -> u32 {
        let previous = self
            .last_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some(next_request_id(id))
            })
            .unwrap_or_default();
        next_request_id(previous)
    }

    /// Send one request with an explicit id and hand back the raw response.
    pub async fn send(
        &self,
        method: UmiMethod,
        command: &str,
        args: Option<&Value>,
        id: u32,
    ) -> SdkResult<reqwest::Response> {
        let body = request_body(method, command, args, id);
        debug!("v1 request: {}", body);
        let response = self
            .http
            .post(&self.url)
            .body(serde_json::to_vec(&body)?)
            .send()
            .await?;
        Ok(response)
    }

    /// Send a request with the next id and parse the JSON answer.
    pub async fn call(
        &self,
        method: UmiMethod,
        command: &str,
        args: Option<&Value>,
    ) -> SdkResult<Value> {
        let response = self.send(method, command, args, self.next_id()).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SdkError::Protocol(format!(
                "{} {} answered with status {}",
                method.as_str(),
                command,
                status
            )));
        }
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Bit operations applied to the `prefs.flags` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagPatch {
    pub and: Option<u64>,
    pub or: Option<u64>,
}

impl FlagPatch {
    pub fn apply(&self, flags: u64) -> u64 {
        let flags = self.and.map_or(flags, |mask| flags & mask);
        self.or.map_or(flags, |bits| flags | bits)
    }
}

/// Flag patch that sets `preference` on a v1 robot.
pub fn flag_patch(preference: Preference) -> FlagPatch {
    let (and, or) = match preference {
        Preference::CarpetBoost(CarpetBoost::Auto) => (Some(65455), None),
        Preference::CarpetBoost(CarpetBoost::Performance) => (None, Some(80)),
        Preference::CarpetBoost(CarpetBoost::Eco) => (Some(65471), Some(16)),
        Preference::EdgeClean(true) => (Some(65533), None),
        Preference::EdgeClean(false) => (None, Some(2)),
        Preference::CleaningPasses(CleaningPasses::Auto) => (Some(64510), None),
        Preference::CleaningPasses(CleaningPasses::One) => (Some(65534), Some(1024)),
        Preference::CleaningPasses(CleaningPasses::Two) => (None, Some(1025)),
        Preference::AlwaysFinish(true) => (Some(65503), None),
        Preference::AlwaysFinish(false) => (None, Some(32)),
    };
    FlagPatch { and, or }
}

/// Cleaning preferences packed in `prefs.flags`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleaningPreferences {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carpet_boost: Option<&'static str>,
    pub edge_clean: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleaning_passes: Option<&'static str>,
    pub always_finish: bool,
}

pub fn decode_cleaning_preferences(flags: u64) -> CleaningPreferences {
    CleaningPreferences {
        carpet_boost: match flags & 80 {
            0 => Some("auto"),
            16 => Some("eco"),
            80 => Some("performance"),
            _ => None,
        },
        edge_clean: flags & 2 == 0,
        cleaning_passes: match flags & 1025 {
            0 => Some("auto"),
            1024 => Some("1"),
            1025 => Some("2"),
            _ => None,
        },
        always_finish: flags & 32 == 0,
    }
}

/// Bin and activity bits of `mssn.flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionFlags {
    pub idle: bool,
    pub bin_full: bool,
    pub bin_removed: bool,
    pub beeping: bool,
}

pub fn decode_mission_flags(flags: u64) -> MissionFlags {
    MissionFlags {
        idle: flags & 4 == 0,
        bin_full: flags & 1 != 0,
        bin_removed: flags & 2 != 0,
        beeping: flags & 8 != 0,
    }
}

/// Human readable text for a `notReady` code.
pub fn not_ready_message(code: Option<u64>) -> &'static str {
    match code {
        Some(0) => "Ready",
        Some(1) => "Near a cliff",
        Some(2) => "Both wheels dropped",
        Some(3) => "Left wheel dropped",
        Some(4) => "Right wheel dropped",
        Some(7) => "Bin missing",
        _ => "Unknown",
    }
}

fn flags_of(response: &Value) -> u64 {
    response["ok"]["flags"].as_u64().unwrap_or(0)
}

/// Adds `cleaningPreferences` to the `ok` object of a `prefs` answer.
pub fn decorate_preferences(response: &mut Value) -> SdkResult<()> {
    let decoded = serde_json::to_value(decode_cleaning_preferences(flags_of(response)))?;
    if let Some(ok) = response.get_mut("ok").and_then(Value::as_object_mut) {
        ok.insert("cleaningPreferences".to_string(), decoded);
    }
    Ok(())
}

/// Adds `missionFlags` and `notReadyMsg` to the `ok` object of a `mssn` answer.
pub fn decorate_mission(response: &mut Value) -> SdkResult<()> {
    let flags = serde_json::to_value(decode_mission_flags(flags_of(response)))?;
    let message = not_ready_message(response["ok"]["notReady"].as_u64());
    if let Some(ok) = response.get_mut("ok").and_then(Value::as_object_mut) {
        ok.insert("missionFlags".to_string(), flags);
        ok.insert("notReadyMsg".to_string(), json!(message));
    }
    Ok(())
}

/// Client for one robot speaking the v1 protocol.
pub struct LocalV1Client {
    umi: UmiClient,
}

impl LocalV1Client {
    pub fn new(config: &LocalConfig) -> SdkResult<Self> {
        config.validate()?;
        let umi = UmiClient::new(&config.host, Some(&config.password), config.connect_timeout())?;
        Ok(Self { umi })
    }

    pub fn umi(&self) -> &UmiClient {
        &self.umi
    }

    async fn get(&self, command: &str) -> SdkResult<Value> {
        self.umi.call(UmiMethod::Get, command, None).await
    }

    async fn set(&self, command: &str, args: &Value) -> SdkResult<Value> {
        self.umi.call(UmiMethod::Set, command, Some(args)).await
    }

    pub async fn get_time(&self) -> SdkResult<Value> {
        self.get("time").await
    }

    pub async fn get_bbrun(&self) -> SdkResult<Value> {
        self.get("bbrun").await
    }

    pub async fn get_langs(&self) -> SdkResult<Value> {
        self.get("langs").await
    }

    pub async fn get_sys(&self) -> SdkResult<Value> {
        self.get("sys").await
    }

    pub async fn get_wireless_last_status(&self) -> SdkResult<Value> {
        self.get("wllaststat").await
    }

    pub async fn get_week(&self) -> SdkResult<Value> {
        self.get("week").await
    }

    pub async fn get_preferences(&self, decode: bool) -> SdkResult<Value> {
        let mut response = self.get("prefs").await?;
        if decode {
            decorate_preferences(&mut response)?;
        }
        Ok(response)
    }

    pub async fn get_mission(&self, decode: bool) -> SdkResult<Value> {
        let mut response = self.get("mssn").await?;
        if decode {
            decorate_mission(&mut response)?;
        }
        Ok(response)
    }

    pub async fn get_wireless_config(&self) -> SdkResult<Value> {
        self.get("wlcfg").await
    }

    pub async fn get_wireless_status(&self) -> SdkResult<Value> {
        self.get("wlstat").await
    }

    pub async fn get_cloud_config(&self) -> SdkResult<Value> {
        self.get("cloudcfg").await
    }

    pub async fn get_sku(&self) -> SdkResult<Value> {
        self.get("sku").await
    }

    async fn operation(&self, op: &str) -> SdkResult<Value> {
        self.set("cmd", &json!({ "op": op })).await
    }

    pub async fn start(&self) -> SdkResult<Value> {
        self.operation("start").await
    }

    pub async fn pause(&self) -> SdkResult<Value> {
        self.operation("pause").await
    }

    pub async fn stop(&self) -> SdkResult<Value> {
        self.operation("stop").await
    }

    pub async fn resume(&self) -> SdkResult<Value> {
        self.operation("resume").await
    }

    pub async fn dock(&self) -> SdkResult<Value> {
        self.operation("dock").await
    }

    pub async fn set_week(&self, args: &Value) -> SdkResult<Value> {
        self.set("week", args).await
    }

    pub async fn set_time(&self, args: &Value) -> SdkResult<Value> {
        self.set("time", args).await
    }

    pub async fn set_ptime(&self, args: &Value) -> SdkResult<Value> {
        self.set("ptime", args).await
    }

    pub async fn set_preferences(&self, args: &Value) -> SdkResult<Value> {
        self.set("prefs", args).await
    }

    /// Read `prefs`, patch its flags for `preference` and write it back.
    pub async fn set_preference(&self, preference: Preference) -> SdkResult<Value> {
        let current = self.get("prefs").await?;
        let Some(prefs) = current.get("ok").and_then(Value::as_object) else {
            return Err(SdkError::Protocol(format!(
                "prefs answer without an ok object: {}",
                current
            )));
        };

        let mut prefs = prefs.clone();
        let flags = flag_patch(preference).apply(flags_of(&current));
        prefs.insert("flags".to_string(), json!(flags));
        self.set_preferences(&Value::Object(prefs)).await
    }

    pub async fn set_carpet_boost(&self, mode: CarpetBoost) -> SdkResult<Value> {
        self.set_preference(Preference::CarpetBoost(mode)).await
    }

    pub async fn set_edge_clean(&self, on: bool) -> SdkResult<Value> {
        self.set_preference(Preference::EdgeClean(on)).await
    }

    pub async fn set_cleaning_passes(&self, passes: CleaningPasses) -> SdkResult<Value> {
        self.set_preference(Preference::CleaningPasses(passes)).await
    }

    pub async fn set_always_finish(&self, on: bool) -> SdkResult<Value> {
        self.set_preference(Preference::AlwaysFinish(on)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body() {
        assert_eq!(
            request_body(UmiMethod::Get, "prefs", None, 3),
            json!({"do": "get", "args": ["prefs"], "id": 3})
        );
        assert_eq!(
            request_body(UmiMethod::Set, "cmd", Some(&json!({"op": "dock"})), 4),
            json!({"do": "set", "args": ["cmd", {"op": "dock"}], "id": 4})
        );
    }

    #[test]
    fn test_request_id_wraps() {
        assert_eq!(next_request_id(0), 1);
        assert_eq!(next_request_id(999), 1000);
        assert_eq!(next_request_id(1000), 1);
    }

    #[test]
    fn test_client_ids_increment() {
        let client = UmiClient::new("192.168.1.20", None, Duration::from_secs(1)).unwrap();
        assert_eq!(client.url(), "https://192.168.1.20:443/umi");
        assert_eq!(client.next_id(), 1);
        assert_eq!(client.next_id(), 2);
    }

    #[test]
    fn test_headers() {
        let headers = default_headers("10.0.0.2", Some("pass")).unwrap();
        assert_eq!(headers[header::AUTHORIZATION], "Basic dXNlcjpwYXNz");
        assert_eq!(headers[header::HOST], "10.0.0.2");
        assert_eq!(headers[header::CONNECTION], "close");
        assert_eq!(headers[header::USER_AGENT], USER_AGENT);

        let anonymous = default_headers("10.0.0.2", None).unwrap();
        assert!(!anonymous.contains_key(header::AUTHORIZATION));
    }

    #[test]
    fn test_flag_patches() {
        let cases = [
            (Preference::CarpetBoost(CarpetBoost::Auto), Some(65455), None),
            (Preference::CarpetBoost(CarpetBoost::Performance), None, Some(80)),
            (Preference::CarpetBoost(CarpetBoost::Eco), Some(65471), Some(16)),
            (Preference::EdgeClean(true), Some(65533), None),
            (Preference::EdgeClean(false), None, Some(2)),
            (Preference::CleaningPasses(CleaningPasses::Auto), Some(64510), None),
            (Preference::CleaningPasses(CleaningPasses::One), Some(65534), Some(1024)),
            (Preference::CleaningPasses(CleaningPasses::Two), None, Some(1025)),
            (Preference::AlwaysFinish(true), Some(65503), None),
            (Preference::AlwaysFinish(false), None, Some(32)),
        ];
        for (preference, and, or) in cases {
            assert_eq!(flag_patch(preference), FlagPatch { and, or }, "{:?}", preference);
        }
    }

    #[test]
    fn test_flag_patch_round_trips_through_decoder() {
        let flags = flag_patch(Preference::CarpetBoost(CarpetBoost::Eco)).apply(80);
        assert_eq!(decode_cleaning_preferences(flags).carpet_boost, Some("eco"));

        let flags = flag_patch(Preference::CleaningPasses(CleaningPasses::One)).apply(1025);
        assert_eq!(decode_cleaning_preferences(flags).cleaning_passes, Some("1"));

        let flags = flag_patch(Preference::EdgeClean(false)).apply(0);
        assert!(!decode_cleaning_preferences(flags).edge_clean);
    }

    #[test]
    fn test_decode_cleaning_preferences() {
        let decoded = decode_cleaning_preferences(0);
        assert_eq!(
            serde_json::to_value(&decoded).unwrap(),
            json!({
                "carpetBoost": "auto",
                "edgeClean": true,
                "cleaningPasses": "auto",
                "alwaysFinish": true
            })
        );

        let decoded = decode_cleaning_preferences(80 | 2 | 1025 | 32);
        assert_eq!(decoded.carpet_boost, Some("performance"));
        assert!(!decoded.edge_clean);
        assert_eq!(decoded.cleaning_passes, Some("2"));
        assert!(!decoded.always_finish);

        // bit patterns with no name are left out
        let decoded = decode_cleaning_preferences(64 | 1);
        assert_eq!(
            serde_json::to_value(&decoded).unwrap(),
            json!({"edgeClean": true, "alwaysFinish": true})
        );
    }

    #[test]
    fn test_decode_mission_flags() {
        assert_eq!(
            decode_mission_flags(0),
            MissionFlags {
                idle: true,
                bin_full: false,
                bin_removed: false,
                beeping: false
            }
        );
        assert_eq!(
            decode_mission_flags(1 | 2 | 4 | 8),
            MissionFlags {
                idle: false,
                bin_full: true,
                bin_removed: true,
                beeping: true
            }
        );
    }

    #[test]
    fn test_not_ready_messages() {
        assert_eq!(not_ready_message(Some(0)), "Ready");
        assert_eq!(not_ready_message(Some(7)), "Bin missing");
        assert_eq!(not_ready_message(Some(5)), "Unknown");
        assert_eq!(not_ready_message(None), "Unknown");
    }

    #[test]
    fn test_decorate_mission() {
        let mut response = json!({"ok": {"flags": 5, "notReady": 3, "cycle": "clean"}});
        decorate_mission(&mut response).unwrap();
        assert_eq!(response["ok"]["notReadyMsg"], json!("Left wheel dropped"));
        assert_eq!(
            response["ok"]["missionFlags"],
            json!({"idle": false, "binFull": true, "binRemoved": false, "beeping": false})
        );
        assert_eq!(response["ok"]["cycle"], json!("clean"));
    }

    #[test]
    fn test_decorate_skips_error_answers() {
        let mut response = json!({"err": 4});
        decorate_preferences(&mut response).unwrap();
        assert_eq!(response, json!({"err": 4}));
    }
}
