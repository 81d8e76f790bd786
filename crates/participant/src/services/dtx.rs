use std::sync::Arc;

use tracing::debug;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::models::info::TrackInfo;

/// Rewrites the opus fmtp on the publisher's answer so DTX matches the
/// pending audio track. This runs after the remote offer is applied but
/// before the answer is created: transceivers exist, yet tracks are not
/// attached, so there is no robust way to map a pending audio track to a
/// specific transceiver. The first pending audio track decides for every
/// receiver-only audio transceiver; with more than one concurrently pending
/// audio track the choice is non-deterministic.
pub async fn configure_receiver_dtx(
    pc: &Arc<RTCPeerConnection>,
    pending_audio: Option<TrackInfo>,
) -> Result<(), webrtc::Error> {
    let Some(pending) = pending_audio else {
        return Ok(());
    };
    let enable_dtx = !pending.disable_dtx;

    for transceiver in pc.get_transceivers().await {
        if transceiver.kind() != RTPCodecType::Audio {
            continue;
        }

        let receiver = transceiver.receiver().await;
        if !receiver.tracks().await.is_empty() {
            continue;
        }

        let mut codecs = receiver.get_parameters().await.codecs;
        for codec in codecs.iter_mut() {
            if codec.capability.mime_type.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
                codec.capability.sdp_fmtp_line =
                    toggle_usedtx(&codec.capability.sdp_fmtp_line, enable_dtx);
            }
        }

        // set_codec_preferences replaces the whole list, so the sender's
        // codecs must ride along untouched.
        let sender = transceiver.sender().await;
        codecs.extend(sender.get_parameters().await.rtp_parameters.codecs);

        transceiver.set_codec_preferences(codecs).await?;
        debug!(enable_dtx, "configured opus dtx on audio transceiver");
    }

    Ok(())
}

/// Strips every `usedtx=1` occurrence from an fmtp line and re-appends it
/// when DTX is enabled.
pub fn toggle_usedtx(fmtp: &str, enable: bool) -> String {
    let mut line = fmtp
        .replace("usedtx=1;", "")
        .replace(";usedtx=1", "")
        .replace("usedtx=1", "");
    if enable {
        line.push_str(";usedtx=1");
    }
    line
}
