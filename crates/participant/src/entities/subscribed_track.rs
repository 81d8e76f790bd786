use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtcp::source_description::SourceDescriptionChunk;

use crate::models::info::TrackType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingStatus {
    Off,
    Partial,
    Optimal,
}

/// Server-to-client leg of a forwarded track, owned by the media engine.
pub trait DownTrack: Send + Sync {
    fn kind(&self) -> TrackType;

    fn create_sender_report(&self) -> Option<SenderReport>;

    fn create_source_description_chunks(&self) -> Option<Vec<SourceDescriptionChunk>>;

    fn forwarding_status(&self) -> ForwardingStatus;

    fn loss_percentage(&self) -> u32;

    fn debug_info(&self) -> serde_json::Value;

    fn close(&self);
}

/// A track this participant receives from another publisher, keyed by the
/// publisher's track sid.
pub struct SubscribedTrack {
    pub track_sid: String,
    pub publisher_identity: String,
    pub down_track: Arc<dyn DownTrack>,
    muted: AtomicBool,
}

impl SubscribedTrack {
    pub fn new(
        track_sid: String,
        publisher_identity: String,
        down_track: Arc<dyn DownTrack>,
    ) -> Self {
        Self {
            track_sid,
            publisher_identity,
            down_track,
            muted: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    #[inline]
    pub fn subscribe_loss_percentage(&self) -> u32 {
        self.down_track.loss_percentage()
    }
}
