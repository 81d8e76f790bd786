use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use super::state::ParticipantState;

#[repr(u8)]
#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq, Hash)]
pub enum TrackType {
    Audio = 0,
    Video = 1,
}

impl From<RTPCodecType> for TrackType {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackType::Audio,
            _ => TrackType::Video,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
pub enum TrackSource {
    Unknown = 0,
    Camera = 1,
    Microphone = 2,
    ScreenShare = 3,
    ScreenShareAudio = 4,
}

/// Server-side description of a published (or pending) track, echoed to
/// clients in signal messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub sid: String,
    #[serde(rename = "type")]
    pub kind: TrackType,
    pub name: String,
    pub muted: bool,
    pub width: u32,
    pub height: u32,
    pub disable_dtx: bool,
    pub source: TrackSource,
}

/// Client request announcing a track it is about to publish. `cid` is the
/// client's MediaStreamTrack id at announcement time; the id observed later
/// in SDP may differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTrackRequest {
    pub cid: String,
    #[serde(rename = "type")]
    pub kind: TrackType,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub muted: bool,
    pub disable_dtx: bool,
    pub source: TrackSource,
}

/// Client capability vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    /// Protocol 4 moved the primary connection to the subscriber side.
    pub fn subscriber_as_primary(&self) -> bool {
        self.0 >= 4
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPermission {
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub can_publish_data: bool,
}

impl Default for ParticipantPermission {
    fn default() -> Self {
        Self {
            can_publish: true,
            can_subscribe: true,
            can_publish_data: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub sid: String,
    pub identity: String,
    pub state: ParticipantState,
    pub tracks: Vec<TrackInfo>,
    pub metadata: String,
    pub joined_at: i64,
    pub hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub sid: String,
    pub name: String,
    pub metadata: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerInfo {
    pub sid: String,
    pub level: f32,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}
