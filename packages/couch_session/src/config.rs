use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::types::Orientation;

// =============================================================================
// File config (figment-deserialized from defaults / couch.toml / env vars)
// =============================================================================
//
//   couch.toml:      [session]
//                    synchronize_time = true
//
//   env var:         COUCH_SESSION__SYNCHRONIZE_TIME=true   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub hub: HubFileConfig,
}

/// Client tunables (lives under `[session]` in couch.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default)]
    pub synchronize_time: bool,
    #[serde(default = "default_setup_document")]
    pub setup_document: bool,
    /// Re-probe the host clock this often once ready. 0 = probe once.
    #[serde(default)]
    pub time_resync_secs: u64,
    #[serde(default = "default_profile_picture_base_url")]
    pub profile_picture_base_url: String,
    #[serde(default)]
    pub nickname: Option<String>,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            orientation: Orientation::default(),
            synchronize_time: false,
            setup_document: default_setup_document(),
            time_resync_secs: 0,
            profile_picture_base_url: default_profile_picture_base_url(),
            nickname: None,
        }
    }
}

/// Hosting backend tunables (lives under `[hub]` in couch.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubFileConfig {
    #[serde(default = "default_join_code_len")]
    pub join_code_len: usize,
    /// Shift applied to the hub clock, for exercising time sync locally.
    #[serde(default)]
    pub clock_skew_ms: i64,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            join_code_len: default_join_code_len(),
            clock_skew_ms: 0,
        }
    }
}

fn default_setup_document() -> bool {
    true
}
fn default_profile_picture_base_url() -> String {
    "https://avatars.couch.local/profile-picture".to_string()
}
fn default_join_code_len() -> usize {
    6
}

pub const MIN_JOIN_CODE_LEN: usize = 4;
pub const MAX_JOIN_CODE_LEN: usize = 12;

impl FileConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        let len = self.hub.join_code_len;
        if !(MIN_JOIN_CODE_LEN..=MAX_JOIN_CODE_LEN).contains(&len) {
            return Err(SessionError::Configuration(format!(
                "hub.join_code_len must be between {MIN_JOIN_CODE_LEN} and {MAX_JOIN_CODE_LEN}, got {len}"
            )));
        }
        if self.session.profile_picture_base_url.is_empty() {
            return Err(SessionError::Configuration(
                "session.profile_picture_base_url must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Build a figment that layers: defaults → `couch.toml` in `config_dir` → COUCH_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `COUCH_SESSION__SYNCHRONIZE_TIME=true`  →  `session.synchronize_time = true`
///   `COUCH_HUB__JOIN_CODE_LEN=4`  →  `hub.join_code_len = 4`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("couch.toml")))
        .merge(Env::prefixed("COUCH_").split("__"))
}

// =============================================================================
// Runtime config
// =============================================================================

/// Construction options for a [`SessionController`](crate::SessionController).
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub orientation: Orientation,
    /// Enables `get_server_time()`; `Ready` waits for the first clock probe.
    pub synchronize_time: bool,
    pub setup_document: bool,
    /// Periodic clock re-probe once ready (None = probe once).
    pub time_resync_interval: Option<Duration>,
    pub profile_picture_base_url: String,
    /// Nickname announced on join.
    pub nickname: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_file(&SessionFileConfig::default())
    }
}

impl SessionConfig {
    pub fn from_file(fc: &SessionFileConfig) -> Self {
        Self {
            orientation: fc.orientation,
            synchronize_time: fc.synchronize_time,
            setup_document: fc.setup_document,
            time_resync_interval: if fc.time_resync_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.time_resync_secs))
            },
            profile_picture_base_url: fc.profile_picture_base_url.clone(),
            nickname: fc.nickname.clone(),
        }
    }

    pub fn with_synchronize_time(mut self, enabled: bool) -> Self {
        self.synchronize_time = enabled;
        self
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }
}
