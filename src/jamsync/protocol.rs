use serde::Deserialize;
use serde_json::{Value, json};

use super::room::{PlaylistChange, RoomEvent};

/// Epoch millis used to stamp envelopes and room activity.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One inbound JSON frame, decoded far enough to route it. The `data`
/// object is kept raw until the per-command payload type is known.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub sub_type: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[serde(default)]
    pub is_host: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayPayload {
    pub track_index: Option<usize>,
    pub position_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeekPayload {
    pub position_ms: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatePayload {
    pub track_index: Option<usize>,
    #[serde(default)]
    pub position_ms: i64,
    pub is_playing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTrackPayload {
    pub track_id: String,
    pub title: Option<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveTrackPayload {
    pub track_index: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveTrackPayload {
    pub from_index: usize,
    pub to_index: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInput {
    pub track_id: String,
    pub title: Option<String>,
    pub duration_ms: Option<i64>,
    pub added_by: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueuePayload {
    pub tracks: Vec<TrackInput>,
}

/// Queue-edit wire name kept as the extension sends it: `allowGuestsAddTracks`
/// toggles the queue-edit flag.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPayload {
    pub allow_guests_add_tracks: Option<bool>,
    pub allow_guests_control: Option<bool>,
}

/// Failure reasons surfaced to clients in ACK envelopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorReason {
    MissingRequiredFields,
    InvalidMessage,
    MissingParams,
    UnknownMessageType,
    UnknownSubtype,
    RoomNotFound,
    RoomNotActive,
    JoinFailed,
    InvalidSession,
    NotAuthorized,
    ActionFailed,
    ProcessingError,
}

impl ErrorReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingRequiredFields => "missing_required_fields",
            Self::InvalidMessage => "invalid_message",
            Self::MissingParams => "missing_params",
            Self::UnknownMessageType => "unknown_message_type",
            Self::UnknownSubtype => "unknown_subtype",
            Self::RoomNotFound => "room_not_found",
            Self::RoomNotActive => "room_not_active",
            Self::JoinFailed => "join_failed",
            Self::InvalidSession => "invalid_session",
            Self::NotAuthorized => "not_authorized",
            Self::ActionFailed => "action_failed",
            Self::ProcessingError => "processing_error",
        }
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unicast reply correlating to a client-originated command.
pub fn ack_frame(success: bool, reason: &str, correlation_id: Option<&str>) -> String {
    json!({
        "type": "ack",
        "data": {
            "success": success,
            "reason": reason,
            "correlationId": correlation_id,
            "timestamp": epoch_ms(),
        }
    })
    .to_string()
}

/// One-shot post-authentication snapshot for a freshly joined member.
pub fn full_state_frame(snapshot: Value) -> String {
    json!({
        "type": "full_state",
        "data": snapshot,
    })
    .to_string()
}

fn system_frame(room_id: &str, event: &str, mut data: Value, ts: i64) -> Value {
    data["roomId"] = json!(room_id);
    data["timestamp"] = json!(ts);
    json!({
        "type": "system",
        "subType": event,
        "data": data,
    })
}

/// Serializes a room event into its broadcast envelope. Built once per event;
/// the broadcaster shares the resulting bytes across all recipients.
pub fn event_frame(room_id: &str, event: &RoomEvent) -> String {
    let ts = epoch_ms();
    let frame = match event {
        RoomEvent::Playback {
            action,
            track_index,
            position_ms,
        } => json!({
            "type": "playback",
            "data": {
                "action": action.as_str(),
                "currentTrackIndex": track_index,
                "positionMs": position_ms,
                "roomId": room_id,
                "timestamp": ts,
            }
        }),
        RoomEvent::PlaylistUpdate(change) => {
            let data = match change {
                PlaylistChange::Add { track } => json!({
                    "action": "add",
                    "track": track,
                    "roomId": room_id,
                    "timestamp": ts,
                }),
                PlaylistChange::Remove { index } => json!({
                    "action": "remove",
                    "index": index,
                    "roomId": room_id,
                    "timestamp": ts,
                }),
                PlaylistChange::Move { from, to } => json!({
                    "action": "move",
                    "fromIndex": from,
                    "toIndex": to,
                    "roomId": room_id,
                    "timestamp": ts,
                }),
            };
            json!({ "type": "playlist_update", "data": data })
        }
        RoomEvent::UserJoined { sender_id } => {
            system_frame(room_id, "user_joined", json!({ "userId": sender_id }), ts)
        }
        RoomEvent::UserLeft { sender_id } => {
            system_frame(room_id, "user_left", json!({ "userId": sender_id }), ts)
        }
        RoomEvent::HostConnected { sender_id } => {
            system_frame(room_id, "host_connected", json!({ "hostId": sender_id }), ts)
        }
        RoomEvent::HostReconnected { sender_id } => system_frame(
            room_id,
            "host_reconnected",
            json!({ "hostId": sender_id }),
            ts,
        ),
        RoomEvent::HostDisconnected => {
            system_frame(room_id, "host_disconnected", json!({}), ts)
        }
        RoomEvent::PlaylistCleared => system_frame(room_id, "playlist_cleared", json!({}), ts),
        RoomEvent::PlaylistSync { tracks } => {
            system_frame(room_id, "playlist_sync", json!({ "tracks": tracks }), ts)
        }
        RoomEvent::PlaylistEnded => system_frame(room_id, "playlist_ended", json!({}), ts),
        RoomEvent::SettingsUpdated {
            allow_guests_control,
            allow_guests_edit_queue,
        } => system_frame(
            room_id,
            "room_settings_updated",
            json!({
                "allowGuestsControl": allow_guests_control,
                "allowGuestsEditQueue": allow_guests_edit_queue,
            }),
            ts,
        ),
        RoomEvent::HealthWarning { detail } => {
            system_frame(room_id, "health_warning", json!({ "detail": detail }), ts)
        }
        RoomEvent::HealthCheckPassed => {
            system_frame(room_id, "health_check_passed", json!({}), ts)
        }
        RoomEvent::RoomClosed => system_frame(room_id, "room_closed", json!({}), ts),
        RoomEvent::RoomExpired => system_frame(room_id, "room_expired", json!({}), ts),
    };

    frame.to_string()
}
