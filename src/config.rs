use serde::{Deserialize, Serialize};

/// Identity shown to other participants of a room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Stable user id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Cursor/selection color, css-style.
    pub color: String,
    /// Optional avatar location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Everything needed to join a collaborative session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollabConfig {
    /// WebSocket endpoint of the relay.
    pub server_url: String,
    /// Room discriminator; one shared document per room.
    pub room_name: String,
    /// The local participant.
    pub user: UserInfo,
    /// Optional token passed through to the relay as a query parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Local-to-remote debounce window in milliseconds.
    #[serde(default = "default_sync_debounce_ms")]
    pub sync_debounce_ms: u64,
    /// Recommended caller-side cursor throttle in milliseconds.
    #[serde(default = "default_awareness_throttle_ms")]
    pub awareness_throttle_ms: u64,
}

fn default_sync_debounce_ms() -> u64 {
    50
}

fn default_awareness_throttle_ms() -> u64 {
    100
}

impl CollabConfig {
    /// Creates a config with default timing for a room.
    pub fn new(server_url: impl Into<String>, room_name: impl Into<String>, user: UserInfo) -> Self {
        Self {
            server_url: server_url.into(),
            room_name: room_name.into(),
            user,
            auth_token: None,
            sync_debounce_ms: default_sync_debounce_ms(),
            awareness_throttle_ms: default_awareness_throttle_ms(),
        }
    }
}
