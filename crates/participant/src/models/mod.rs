use std::sync::Arc;
use std::time::Duration;

pub mod data_packet;
pub mod info;
pub mod quality;
pub mod signal;
pub mod state;

use crate::entities::media_track::{MediaTrackFactory, TwccResponderFactory};
use info::{ParticipantPermission, ProtocolVersion};
use signal::SignalSink;

/// Transport-level knobs shared by both peer connections.
#[derive(Debug, Clone, Default)]
pub struct WebRtcConfig {
    pub public_ip: String,
    pub port_min: u16,
    pub port_max: u16,
}

/// Minimum spacing between forwarded keyframe requests, per simulcast tier.
#[derive(Debug, Clone)]
pub struct PliThrottleConfig {
    pub low_quality: Duration,
    pub mid_quality: Duration,
    pub high_quality: Duration,
}

impl Default for PliThrottleConfig {
    fn default() -> Self {
        Self {
            low_quality: Duration::from_millis(500),
            mid_quality: Duration::from_secs(1),
            high_quality: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct ParticipantParams {
    /// Caller-chosen identity, immutable for the participant's lifetime.
    pub identity: String,
    pub metadata: String,
    pub sink: Arc<dyn SignalSink>,
    pub protocol_version: ProtocolVersion,
    /// Absent means everything is allowed.
    pub permission: Option<ParticipantPermission>,
    pub hidden: bool,
    pub rtc: WebRtcConfig,
    pub pli_throttle: PliThrottleConfig,
    pub media_factory: MediaTrackFactory,
    pub twcc_factory: TwccResponderFactory,
}
