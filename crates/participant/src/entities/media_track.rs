use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::rtcp::packet::Packet;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::models::info::{TrackInfo, TrackType};
use crate::participant::Participant;
use crate::services::rtcp_router::RtcpBatch;

pub type OnTrackClose = Box<dyn Fn() + Send + Sync>;

pub type TwccOnFeedback = Box<dyn Fn(Box<dyn Packet + Send + Sync>) + Send + Sync>;

/// Transport-wide congestion control responder owned by the media engine.
/// One responder exists per participant regardless of track count; it is
/// created with the SSRC of the first published track and hands assembled
/// feedback packets to the registered callback.
pub trait TwccResponder: Send + Sync {
    fn on_feedback(&self, f: TwccOnFeedback);
}

pub type TwccResponderFactory = Arc<dyn Fn(u32) -> Arc<dyn TwccResponder> + Send + Sync>;

/// Everything the media engine needs to materialize a published track.
pub struct MediaTrackParams {
    pub track_info: TrackInfo,
    /// Identifier announced by the client when the track was added.
    pub signal_cid: String,
    /// Identifier observed in the negotiated SDP; may differ from the
    /// signal cid.
    pub sdp_cid: String,
    pub participant_sid: String,
    pub participant_identity: String,
    /// Receivers push RTCP batches here; the participant forwards them to
    /// the publisher peer connection.
    pub rtcp_sender: mpsc::Sender<RtcpBatch>,
    pub twcc: Arc<dyn TwccResponder>,
}

/// A published track as seen by the participant. The forwarding engine
/// implements this; the participant only tracks identity, mute state and
/// subscriber membership.
#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn sid(&self) -> String;

    fn kind(&self) -> TrackType;

    fn signal_cid(&self) -> String;

    fn sdp_cid(&self) -> String;

    fn is_muted(&self) -> bool;

    fn set_muted(&self, muted: bool);

    fn to_proto(&self) -> TrackInfo;

    /// `(level, voice activity)` from the audio level meter, when the track
    /// carries one. Lower levels are louder.
    fn audio_level(&self) -> Option<(u8, bool)>;

    fn publish_loss_percentage(&self) -> u32;

    /// `(publishing, registered)` simulcast layer counts.
    fn num_up_tracks(&self) -> (u32, u32);

    /// Registers a hook run when the underlying media flow ends.
    fn on_close(&self, hook: OnTrackClose);

    async fn add_receiver(&self, receiver: Arc<RTCRtpReceiver>, track: Arc<TrackRemote>);

    async fn start(&self);

    async fn add_subscriber(&self, subscriber: Arc<Participant>) -> Result<(), anyhow::Error>;

    async fn remove_subscriber(&self, participant_sid: &str);

    async fn remove_all_subscribers(&self);
}

pub type MediaTrackFactory = Arc<dyn Fn(MediaTrackParams) -> Arc<dyn MediaTrack> + Send + Sync>;
