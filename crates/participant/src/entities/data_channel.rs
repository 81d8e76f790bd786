use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::peer_connection::RTCPeerConnection;

use crate::models::data_packet::DataPacketKind;

pub const RELIABLE_DATA_CHANNEL: &str = "_reliable";
pub const LOSSY_DATA_CHANNEL: &str = "_lossy";

/// The reliable/lossy data channel pair, in both directions. Inbound channels
/// arrive on the publisher peer connection and are latched by label; outbound
/// channels are created on the subscriber peer connection when the subscriber
/// is the primary transport.
pub struct DataChannelSet {
    subscriber_primary: bool,
    reliable: RwLock<Option<Arc<RTCDataChannel>>>,
    lossy: RwLock<Option<Arc<RTCDataChannel>>>,
    reliable_sub: RwLock<Option<Arc<RTCDataChannel>>>,
    lossy_sub: RwLock<Option<Arc<RTCDataChannel>>>,
}

impl DataChannelSet {
    pub fn new(subscriber_primary: bool) -> Self {
        Self {
            subscriber_primary,
            reliable: RwLock::new(None),
            lossy: RwLock::new(None),
            reliable_sub: RwLock::new(None),
            lossy_sub: RwLock::new(None),
        }
    }

    /// Proactively opens both outbound channels on the subscriber peer
    /// connection.
    pub async fn create_subscriber_channels(
        &self,
        pc: &Arc<RTCPeerConnection>,
    ) -> Result<(), webrtc::Error> {
        let reliable = pc
            .create_data_channel(
                RELIABLE_DATA_CHANNEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        *self.reliable_sub.write() = Some(reliable);

        let lossy = pc
            .create_data_channel(
                LOSSY_DATA_CHANNEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    max_retransmits: Some(0),
                    ..Default::default()
                }),
            )
            .await?;
        *self.lossy_sub.write() = Some(lossy);

        Ok(())
    }

    /// Latches an inbound channel by label, returning the reliability class
    /// it carries. Unknown labels are dropped with a warning.
    pub fn latch_inbound(&self, dc: &Arc<RTCDataChannel>) -> Option<DataPacketKind> {
        match dc.label() {
            RELIABLE_DATA_CHANNEL => {
                *self.reliable.write() = Some(dc.clone());
                Some(DataPacketKind::Reliable)
            }
            LOSSY_DATA_CHANNEL => {
                *self.lossy.write() = Some(dc.clone());
                Some(DataPacketKind::Lossy)
            }
            label => {
                warn!(label, "ignoring data channel with unknown label");
                None
            }
        }
    }

    /// Picks the channel for an outgoing packet by reliability class and by
    /// primary direction.
    pub fn outbound(&self, kind: DataPacketKind) -> Option<Arc<RTCDataChannel>> {
        if self.subscriber_primary {
            match kind {
                DataPacketKind::Reliable => self.reliable_sub.read().clone(),
                DataPacketKind::Lossy => self.lossy_sub.read().clone(),
            }
        } else {
            match kind {
                DataPacketKind::Reliable => self.reliable.read().clone(),
                DataPacketKind::Lossy => self.lossy.read().clone(),
            }
        }
    }
}
