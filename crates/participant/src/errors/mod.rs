use thiserror::Error;

use crate::models::signal::SignalTarget;

#[derive(Debug, Error)]
pub enum ParticipantError {
    #[error("participant identity must not be empty")]
    MissingIdentity,

    #[error("expected an answer, received a different sdp type")]
    UnexpectedOffer,

    #[error("failed to create peer connection")]
    CreatePeer(#[source] webrtc::Error),

    #[error("{phase} failed on the {target:?} peer connection")]
    Transport {
        phase: &'static str,
        target: SignalTarget,
        #[source]
        source: webrtc::Error,
    },

    #[error("data channel unavailable")]
    DataChannelUnavailable,

    #[error("failed to encode data packet")]
    EncodeDataPacket(#[from] serde_json::Error),

    #[error("failed to send data packet")]
    DataChannelSend(#[source] webrtc::Error),

    #[error("failed to deliver {kind} signal: {cause}")]
    Delivery {
        kind: &'static str,
        cause: anyhow::Error,
    },
}
