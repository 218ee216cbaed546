//! Core session types: device addressing, per-device state, orientation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Index of a device slot within a session.
///
/// Slot 0 is always the screen; controllers occupy slots 1 and up.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// The device id of the game screen.
    pub const SCREEN: DeviceId = DeviceId(0);

    pub fn is_screen(self) -> bool {
        self == Self::SCREEN
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device-{}", self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(id: u32) -> Self {
        DeviceId(id)
    }
}

/// State of one occupied device slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Globally unique identity of the user. Never changes while the slot is occupied.
    pub uid: String,
    /// Application-defined state set via `set_custom_state`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    /// Set by the host when the device has high server latency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slow_connection: Option<bool>,
}

impl DeviceState {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            custom: None,
            nickname: None,
            slow_connection: None,
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn is_slow(&self) -> bool {
        self.slow_connection.unwrap_or(false)
    }
}

/// Display orientation requested from the rendering collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Landscape => write!(f, "landscape"),
            Self::Portrait => write!(f, "portrait"),
        }
    }
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "landscape" => Ok(Self::Landscape),
            "portrait" => Ok(Self::Portrait),
            _ => Err(format!("unknown orientation: {s}")),
        }
    }
}

/// Which side of the session a client joins as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Screen,
    Controller,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_id_is_zero() {
        assert_eq!(DeviceId::SCREEN, DeviceId(0));
        assert!(DeviceId(0).is_screen());
        assert!(!DeviceId(3).is_screen());
    }

    #[test]
    fn device_id_serializes_as_number() {
        assert_eq!(serde_json::to_string(&DeviceId(7)).unwrap(), "7");
        let id: DeviceId = serde_json::from_str("2").unwrap();
        assert_eq!(id, DeviceId(2));
    }

    #[test]
    fn device_state_omits_unset_fields() {
        let state = DeviceState::new("u1");
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json, serde_json::json!({ "uid": "u1" }));

        let back: DeviceState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
        assert!(!back.is_slow());
    }

    #[test]
    fn orientation_parse() {
        assert_eq!("portrait".parse::<Orientation>(), Ok(Orientation::Portrait));
        assert_eq!(Orientation::Landscape.to_string(), "landscape");
        assert!("sideways".parse::<Orientation>().is_err());
    }
}
