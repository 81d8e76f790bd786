use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::info::{IceServerInfo, ParticipantInfo, RoomInfo, SpeakerInfo, TrackInfo};
use super::quality::ConnectionQualityInfo;

/// Which of the two peer connections a message refers to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
pub enum SignalTarget {
    Publisher = 0,
    Subscriber = 1,
}

/// Outbound signaling, multiplexed over the participant's sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SignalMessage {
    Answer {
        sdp: RTCSessionDescription,
    },
    Offer {
        sdp: RTCSessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Trickle {
        target: SignalTarget,
        candidate_init: String,
    },
    #[serde(rename_all = "camelCase")]
    Join {
        room: RoomInfo,
        participant: ParticipantInfo,
        other_participants: Vec<ParticipantInfo>,
        server_version: String,
        ice_servers: Vec<IceServerInfo>,
        subscriber_primary: bool,
    },
    Update {
        participants: Vec<ParticipantInfo>,
    },
    SpeakersChanged {
        speakers: Vec<SpeakerInfo>,
    },
    RoomUpdate {
        room: RoomInfo,
    },
    ConnectionQuality {
        updates: Vec<ConnectionQualityInfo>,
    },
    Mute {
        sid: String,
        muted: bool,
    },
    TrackPublished {
        cid: String,
        track: TrackInfo,
    },
    Leave,
    StreamedTracksUpdate {
        paused: Vec<String>,
        resumed: Vec<String>,
    },
}

impl SignalMessage {
    /// Message kind label used for logging and error reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Trickle { .. } => "trickle",
            SignalMessage::Join { .. } => "join",
            SignalMessage::Update { .. } => "update",
            SignalMessage::SpeakersChanged { .. } => "speakersChanged",
            SignalMessage::RoomUpdate { .. } => "roomUpdate",
            SignalMessage::ConnectionQuality { .. } => "connectionQuality",
            SignalMessage::Mute { .. } => "mute",
            SignalMessage::TrackPublished { .. } => "trackPublished",
            SignalMessage::Leave => "leave",
            SignalMessage::StreamedTracksUpdate { .. } => "streamedTracksUpdate",
        }
    }
}

/// Write side of the participant's signaling connection. Implementations
/// serialize writes internally; the participant may call `write_message` from
/// any task.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn write_message(&self, msg: SignalMessage) -> Result<(), anyhow::Error>;

    async fn close(&self);
}
