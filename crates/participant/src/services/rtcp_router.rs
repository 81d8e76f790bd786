use std::sync::Weak;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtcp::packet::Packet;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtcp::source_description::{SourceDescription, SourceDescriptionChunk};

use crate::models::state::ParticipantState;
use crate::participant::Participant;
use crate::services::pli_throttle::PliThrottle;

pub type RtcpBatch = Vec<Box<dyn Packet + Send + Sync>>;

/// Depth of the receiver-to-publisher RTCP queue. Producers block when it
/// backs up.
pub const RTCP_CHANNEL_DEPTH: usize = 50;

/// Upper bound on SRs plus SDES chunks per compound packet.
const SD_BATCH_SIZE: usize = 20;

const SUBSCRIBER_RTCP_INTERVAL: Duration = Duration::from_secs(5);

/// Applies the keyframe-request throttle to a batch. PLI and FIR packets for
/// over-budget SSRCs are dropped; everything else passes through.
pub fn filter_batch(throttle: &PliThrottle, batch: RtcpBatch) -> RtcpBatch {
    batch
        .into_iter()
        .filter(|pkt| {
            if let Some(pli) = pkt.as_any().downcast_ref::<PictureLossIndication>() {
                throttle.can_send(pli.media_ssrc)
            } else if let Some(fir) = pkt.as_any().downcast_ref::<FullIntraRequest>() {
                throttle.can_send(fir.media_ssrc)
            } else {
                true
            }
        })
        .collect()
}

/// Packs sender reports and SDES chunks into compound batches. SRs fill each
/// compound first, up to the batch size; SDES chunks take the remaining
/// budget as a single SourceDescription. Compounds are emitted until both
/// queues drain.
pub fn pack_compounds(
    mut srs: Vec<SenderReport>,
    mut chunks: Vec<SourceDescriptionChunk>,
) -> Vec<RtcpBatch> {
    let mut compounds = Vec::new();

    while !srs.is_empty() || !chunks.is_empty() {
        let mut batch: RtcpBatch = Vec::new();

        let num_srs = srs.len().min(SD_BATCH_SIZE);
        for sr in srs.drain(..num_srs) {
            batch.push(Box::new(sr));
        }

        let budget = SD_BATCH_SIZE - num_srs;
        let num_chunks = chunks.len().min(budget);
        if num_chunks > 0 {
            batch.push(Box::new(SourceDescription {
                chunks: chunks.drain(..num_chunks).collect(),
            }));
        }

        compounds.push(batch);
    }

    compounds
}

/// Consumes receiver RTCP batches and forwards the filtered result to the
/// publisher peer connection. Exits when the channel closes, the token is
/// cancelled or the participant is gone.
pub(crate) async fn publisher_rtcp_worker(
    participant: Weak<Participant>,
    mut rx: mpsc::Receiver<RtcpBatch>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            batch = rx.recv() => {
                let Some(batch) = batch else { break };
                let Some(participant) = participant.upgrade() else { break };

                let batch = filter_batch(participant.pli_throttle(), batch);
                if batch.is_empty() {
                    continue;
                }
                if let Err(err) = participant.publisher().pc().write_rtcp(&batch).await {
                    debug!(%err, "failed to forward rtcp to publisher");
                }
            }
        }
    }
}

/// Periodically delivers sender reports and source descriptions for every
/// subscribed track to the subscriber peer connection.
pub(crate) async fn subscriber_rtcp_worker(
    participant: Weak<Participant>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(SUBSCRIBER_RTCP_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(participant) = participant.upgrade() else { break };
                if participant.state() == ParticipantState::Disconnected {
                    break;
                }
                if participant.subscriber().connection_state() != RTCPeerConnectionState::Connected {
                    continue;
                }

                let (srs, chunks) = participant.collect_subscriber_reports();
                for batch in pack_compounds(srs, chunks) {
                    if let Err(err) = participant.subscriber().pc().write_rtcp(&batch).await {
                        if matches!(err, webrtc::Error::ErrConnectionClosed) {
                            return;
                        }
                        warn!(%err, "failed to send sender reports to subscriber");
                    }
                }
            }
        }
    }
}
