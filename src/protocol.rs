//! Wire format shared with the browser client.
//!
//! Every frame is a JSON envelope `{"evt": <code>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::PlaybackAction;

/// Event codes understood by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventCode {
    SetName = 1,
    Playlist = 2,
    Status = 3,
    PlaylistAdd = 5,
    Settings = 8,
    SetSettings = 9,
    Play = 10,
    Pause = 11,
    Next = 12,
    Prev = 13,
    PlaylistClear = 15,
    WatchingStateChange = 18,
    ChatMessage = 19,
    Notification = 20,
    Error = 21,
    Auth = 22,
    ChatCmd = 23,
    ReloadPlaylist = 24,
}

impl EventCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for EventCode {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, i32> {
        let evt = match code {
            1 => EventCode::SetName,
            2 => EventCode::Playlist,
            3 => EventCode::Status,
            5 => EventCode::PlaylistAdd,
            8 => EventCode::Settings,
            9 => EventCode::SetSettings,
            10 => EventCode::Play,
            11 => EventCode::Pause,
            12 => EventCode::Next,
            13 => EventCode::Prev,
            15 => EventCode::PlaylistClear,
            18 => EventCode::WatchingStateChange,
            19 => EventCode::ChatMessage,
            20 => EventCode::Notification,
            21 => EventCode::Error,
            22 => EventCode::Auth,
            23 => EventCode::ChatCmd,
            24 => EventCode::ReloadPlaylist,
            other => return Err(other),
        };
        Ok(evt)
    }
}

/// Incoming frame, payload decoded later per event
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub evt: i32,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a, T: Serialize> {
    evt: i32,
    data: &'a T,
}

/// Serialize one outgoing frame
pub fn encode<T: Serialize>(evt: EventCode, data: &T) -> serde_json::Result<String> {
    serde_json::to_string(&OutgoingEnvelope { evt: evt.code(), data })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetNameData {
    pub name: String,
    #[serde(default)]
    pub old: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReply {
    /// Seconds into the current item
    pub timestamp: u64,
    pub action: PlaybackAction,
    pub viewers: BTreeMap<String, bool>,
    #[serde(rename = "viewerCount")]
    pub viewer_count: usize,
    pub playing: bool,
}

fn resume_index() -> i64 {
    -1
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PlayRequest {
    /// `-1` resumes from the current item
    #[serde(default = "resume_index")]
    pub index: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct WatchingStatusUpdate {
    pub watching: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub msg: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub msg: String,
    /// Shown even when the client has muted ordinary notifications
    pub bypass: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReply {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatCommand {
    pub cmd: String,
    pub target: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_code_round_trip() {
        for code in [1, 2, 3, 5, 8, 9, 10, 11, 12, 13, 15, 18, 19, 20, 21, 22, 23, 24] {
            let evt = EventCode::try_from(code).unwrap();
            assert_eq!(evt.code(), code);
        }
        assert_eq!(EventCode::try_from(4), Err(4));
        assert_eq!(EventCode::try_from(99), Err(99));
    }

    #[test]
    fn test_encode_envelope() {
        let json = encode(EventCode::Error, &ErrorReply { error: "nope".into() }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["evt"], 21);
        assert_eq!(value["data"]["error"], "nope");
    }

    #[test]
    fn test_envelope_without_payload() {
        let env: Envelope = serde_json::from_str(r#"{"evt": 11}"#).unwrap();
        assert_eq!(env.evt, 11);
        assert!(env.data.is_null());
    }

    #[test]
    fn test_play_request_defaults_to_resume() {
        let req: PlayRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.index, -1);
        let req: PlayRequest = serde_json::from_str(r#"{"index": 3}"#).unwrap();
        assert_eq!(req.index, 3);
    }

    #[test]
    fn test_status_reply_shape() {
        let mut viewers = BTreeMap::new();
        viewers.insert("guest#0".to_string(), true);
        let reply = StatusReply {
            timestamp: 42,
            action: PlaybackAction::Paused,
            viewers,
            viewer_count: 1,
            playing: false,
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["timestamp"], 42);
        assert_eq!(value["action"], "Paused");
        assert_eq!(value["viewers"]["guest#0"], true);
        assert_eq!(value["viewerCount"], 1);
    }
}
