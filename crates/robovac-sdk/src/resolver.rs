//! Read-request resolution against the device shadow.
//!
//! Robots push their state in partial fragments with nothing that ties a
//! fragment to the read that wants it. A read therefore registers a predicate
//! over the shadow ("are all of these properties known yet?") and is woken
//! each time the reconciler merges something, until the predicate holds.
//!
//! Properties gated by an [`OptionalCapability`] resolve as "no value" once the
//! robot's capability set is known and does not list them, instead of waiting
//! for a report that will never come.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::capability::OptionalCapability;
use crate::error::{SdkError, SdkResult};
use crate::state::{DeviceShadow, Projection, StateDocument};

/// Result of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// A single projected property
    Value(Option<Value>),
    /// Several projected properties
    Projection(Projection),
    /// The whole document
    Document(StateDocument),
}

impl Reading {
    /// Value of one property, whatever the shape of the reading.
    pub fn get(&self, property: &str) -> Option<&Value> {
        match self {
            Self::Value(value) => value.as_ref(),
            Self::Projection(projection) => projection.get(property).and_then(Option::as_ref),
            Self::Document(document) => document.get(property),
        }
    }

    /// Render as JSON; properties without a value become `null`.
    pub fn into_json(self) -> Value {
        match self {
            Self::Value(value) => value.unwrap_or(Value::Null),
            Self::Projection(projection) => Value::Object(
                projection
                    .into_iter()
                    .map(|(name, value)| (name, value.unwrap_or(Value::Null)))
                    .collect(),
            ),
            Self::Document(document) => Value::Object(document),
        }
    }
}

/// Per-read options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Give up with [`SdkError::Timeout`] after this long. `None` waits until
    /// the state arrives or the session closes.
    pub timeout: Option<Duration>,
}

impl ReadOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// How a required property stands against the current shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyStatus {
    Present,
    /// Gated by a capability the robot reported it does not have
    Unsupported,
    Missing,
}

pub fn property_status(shadow: &DeviceShadow, property: &str) -> PropertyStatus {
    if let (Some(capability), Some(capabilities)) = (
        OptionalCapability::from_property(property),
        shadow.capabilities(),
    ) {
        if !capabilities.supports(capability) {
            return PropertyStatus::Unsupported;
        }
    }

    if shadow.contains(property) {
        PropertyStatus::Present
    } else {
        PropertyStatus::Missing
    }
}

pub fn is_satisfied(shadow: &DeviceShadow, required: &[&str]) -> bool {
    required
        .iter()
        .all(|property| property_status(shadow, property) != PropertyStatus::Missing)
}

fn projected_value(shadow: &DeviceShadow, property: &str) -> Option<Value> {
    match property_status(shadow, property) {
        PropertyStatus::Unsupported => None,
        _ => shadow.get(property).cloned(),
    }
}

/// Build the reading a satisfied request resolves with.
///
/// A projection of exactly one property is returned as the bare value.
pub fn project(shadow: &DeviceShadow, required: &[&str], project_only: bool) -> Reading {
    if !project_only {
        return Reading::Document(shadow.document().clone());
    }

    if let [property] = required {
        return Reading::Value(projected_value(shadow, property));
    }

    Reading::Projection(
        required
            .iter()
            .map(|property| (property.to_string(), projected_value(shadow, property)))
            .collect(),
    )
}

/// Resolves reads against a shared shadow. Cheap to clone; every clone and
/// every call waits independently.
#[derive(Clone)]
pub struct ReadResolver {
    shadow: watch::Receiver<DeviceShadow>,
    options: ReadOptions,
}

impl ReadResolver {
    pub fn new(shadow: watch::Receiver<DeviceShadow>) -> Self {
        Self {
            shadow,
            options: ReadOptions::default(),
        }
    }

    /// Default options for reads that do not pass their own.
    pub fn with_options(mut self, options: ReadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> ReadOptions {
        self.options
    }

    pub fn snapshot(&self) -> DeviceShadow {
        self.shadow.borrow().clone()
    }

    /// Wait until every required property is known, then resolve with the
    /// projection (or the whole document when `project_only` is false).
    pub async fn wait_for(&self, required: &[&str], project_only: bool) -> SdkResult<Reading> {
        self.wait_for_with(required, project_only, self.options).await
    }

    pub async fn wait_for_with(
        &self,
        required: &[&str],
        project_only: bool,
        options: ReadOptions,
    ) -> SdkResult<Reading> {
        let mut shadow = self.shadow.clone();

        let wait = async move {
            let current = shadow
                .wait_for(|state| is_satisfied(state, required))
                .await
                .map_err(|_| SdkError::Closed)?;
            Ok::<_, SdkError>(project(&current, required, project_only))
        };

        match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(reading) => reading,
                Err(_) => {
                    debug!("Read of {:?} timed out after {:?}", required, limit);
                    Err(SdkError::timeout(limit))
                }
            },
            None => wait.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shadow(reported: Value) -> DeviceShadow {
        let mut shadow = DeviceShadow::new();
        shadow.merge_reported(reported.as_object().cloned().unwrap());
        shadow
    }

    #[test]
    fn test_property_status() {
        let state = shadow(json!({"batPct": 80}));
        assert_eq!(property_status(&state, "batPct"), PropertyStatus::Present);
        assert_eq!(property_status(&state, "pose"), PropertyStatus::Missing);

        let state = shadow(json!({"cap": {"ota": 1}}));
        assert_eq!(property_status(&state, "pose"), PropertyStatus::Unsupported);
        assert_eq!(property_status(&state, "sku"), PropertyStatus::Missing);
    }

    #[test]
    fn test_non_object_capabilities_mark_gated_properties_unsupported() {
        let mut state = shadow(json!({"cap": {"pose": 1}, "pose": {"theta": 0}}));
        assert_eq!(property_status(&state, "pose"), PropertyStatus::Present);

        state.merge_reported(json!({"cap": 7}).as_object().cloned().unwrap());
        assert_eq!(property_status(&state, "pose"), PropertyStatus::Unsupported);
        assert_eq!(project(&state, &["pose"], true), Reading::Value(None));
    }

    #[test]
    fn test_unsupported_masks_reported_value() {
        let state = shadow(json!({"cap": {"ota": 1}, "carpetBoost": true}));
        assert_eq!(project(&state, &["carpetBoost"], true), Reading::Value(None));
    }

    #[test]
    fn test_project_single_value_unwrapped() {
        let state = shadow(json!({"batPct": 80, "sku": "R980020"}));
        assert_eq!(project(&state, &["batPct"], true), Reading::Value(Some(json!(80))));
    }

    #[test]
    fn test_project_several() {
        let state = shadow(json!({"batPct": 80, "sku": "R980020", "name": "Rosie"}));
        let reading = project(&state, &["batPct", "sku"], true);

        let Reading::Projection(projection) = &reading else {
            panic!("expected projection, got {:?}", reading);
        };
        assert_eq!(projection.len(), 2);
        assert_eq!(reading.get("sku"), Some(&json!("R980020")));
        assert_eq!(reading.get("name"), None);
    }

    #[test]
    fn test_project_full_document() {
        let state = shadow(json!({"batPct": 80, "name": "Rosie"}));
        let reading = project(&state, &["batPct"], false);
        assert_eq!(
            reading.into_json(),
            json!({"batPct": 80, "name": "Rosie"})
        );
    }

    #[test]
    fn test_reading_into_json() {
        let mut projection = Projection::new();
        projection.insert("pose".to_string(), None);
        projection.insert("bin".to_string(), Some(json!({"full": false})));

        assert_eq!(
            Reading::Projection(projection).into_json(),
            json!({"pose": null, "bin": {"full": false}})
        );
        assert_eq!(Reading::Value(None).into_json(), Value::Null);
    }

    #[tokio::test]
    async fn test_wait_for_already_satisfied() {
        let (_tx, rx) = watch::channel(shadow(json!({"batPct": 80})));
        let resolver = ReadResolver::new(rx);

        let reading = resolver.wait_for(&["batPct"], true).await.unwrap();
        assert_eq!(reading, Reading::Value(Some(json!(80))));
    }

    #[tokio::test]
    async fn test_wait_for_closed_session() {
        let (tx, rx) = watch::channel(DeviceShadow::new());
        let resolver = ReadResolver::new(rx);
        drop(tx);

        let err = resolver.wait_for(&["batPct"], true).await.unwrap_err();
        assert!(matches!(err, SdkError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_timeout() {
        let (_tx, rx) = watch::channel(DeviceShadow::new());
        let resolver = ReadResolver::new(rx);

        let err = resolver
            .wait_for_with(
                &["batPct"],
                true,
                ReadOptions::with_timeout(Duration::from_millis(250)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Timeout(250)));
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_merge() {
        let (tx, rx) = watch::channel(DeviceShadow::new());
        let resolver = ReadResolver::new(rx);

        let pending = tokio::spawn(async move { resolver.wait_for(&["utctime"], true).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        tx.send_modify(|state| {
            state.merge_reported(json!({"utctime": 1_700_000_000}).as_object().cloned().unwrap())
        });

        let reading = pending.await.unwrap().unwrap();
        assert_eq!(reading, Reading::Value(Some(json!(1_700_000_000))));
    }
}
