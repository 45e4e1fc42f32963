//! Optional device capabilities.
//!
//! Robots report the features they have under the `cap` property. Some state
//! properties are only ever reported when the matching capability is present,
//! so reads for them must not wait once the robot has told us it lacks it.

use std::fmt;

use serde_json::{Map, Value};

/// Optional features whose state property shares the capability's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionalCapability {
    Pose,
    Ota,
    MultiPass,
    CarpetBoost,
    Pp,
    BinFullDetect,
    LangOta,
    Maps,
    Edge,
    Eco,
    SvcConf,
}

impl OptionalCapability {
    pub const ALL: [OptionalCapability; 11] = [
        Self::Pose,
        Self::Ota,
        Self::MultiPass,
        Self::CarpetBoost,
        Self::Pp,
        Self::BinFullDetect,
        Self::LangOta,
        Self::Maps,
        Self::Edge,
        Self::Eco,
        Self::SvcConf,
    ];

    /// Key used both in `cap` and in the state document.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pose => "pose",
            Self::Ota => "ota",
            Self::MultiPass => "multiPass",
            Self::CarpetBoost => "carpetBoost",
            Self::Pp => "pp",
            Self::BinFullDetect => "binFullDetect",
            Self::LangOta => "langOta",
            Self::Maps => "maps",
            Self::Edge => "edge",
            Self::Eco => "eco",
            Self::SvcConf => "svcConf",
        }
    }

    /// Look up the capability gating a state property, if any.
    pub fn from_property(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cap| cap.as_str() == name)
    }
}

impl fmt::Display for OptionalCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities last reported by the robot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySet {
    entries: Map<String, Value>,
}

impl CapabilitySet {
    /// Build from the reported `cap` value. Non-objects are ignored.
    pub fn from_reported(value: &Value) -> Option<Self> {
        value.as_object().map(|entries| Self {
            entries: entries.clone(),
        })
    }

    pub fn supports(&self, capability: OptionalCapability) -> bool {
        self.entries.contains_key(capability.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_property() {
        assert_eq!(
            OptionalCapability::from_property("pose"),
            Some(OptionalCapability::Pose)
        );
        assert_eq!(
            OptionalCapability::from_property("binFullDetect"),
            Some(OptionalCapability::BinFullDetect)
        );
        assert_eq!(OptionalCapability::from_property("batPct"), None);
        assert_eq!(OptionalCapability::from_property("Pose"), None);
    }

    #[test]
    fn test_names_round_trip() {
        for cap in OptionalCapability::ALL {
            assert_eq!(OptionalCapability::from_property(cap.as_str()), Some(cap));
        }
    }

    #[test]
    fn test_capability_set() {
        let set = CapabilitySet::from_reported(&json!({"pose": 1, "ota": 2, "multiPass": 2}))
            .unwrap();

        assert!(set.supports(OptionalCapability::Pose));
        assert!(set.supports(OptionalCapability::MultiPass));
        assert!(!set.supports(OptionalCapability::CarpetBoost));
        assert_eq!(set.get("ota"), Some(&json!(2)));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_non_object_cap_ignored() {
        assert!(CapabilitySet::from_reported(&json!(7)).is_none());
        assert!(CapabilitySet::from_reported(&json!(null)).is_none());
    }
}
