use std::sync::Arc;

use tracing::warn;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpHeaderExtensionCapability, RTPCodecType};
use webrtc::rtp_transceiver::{
    RTCPFeedback, TYPE_RTCP_FB_GOOG_REMB, TYPE_RTCP_FB_NACK, TYPE_RTCP_FB_TRANSPORT_CC,
};

use crate::errors::ParticipantError;
use crate::models::WebRtcConfig;
use crate::models::signal::SignalTarget;

const SIMULCAST_HEADER_EXTENSIONS: [&str; 4] = [
    "urn:ietf:params:rtp-hdrext:sdes:mid",
    "urn:ietf:params:rtp-hdrext:sdes:rtp-stream-id",
    "urn:ietf:params:rtp-hdrext:sdes:repaired-rtp-stream-id",
    "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time",
];

pub async fn new_peer_connection(
    config: &WebRtcConfig,
) -> Result<Arc<RTCPeerConnection>, ParticipantError> {
    let rtc_config = RTCConfiguration {
        ice_servers: vec![],
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ice_transport_policy: RTCIceTransportPolicy::All,
        ice_candidate_pool_size: 20,
        ..Default::default()
    };

    let mut media = MediaEngine::default();
    media
        .register_default_codecs()
        .map_err(ParticipantError::CreatePeer)?;

    for typ in [
        TYPE_RTCP_FB_GOOG_REMB,
        TYPE_RTCP_FB_TRANSPORT_CC,
        TYPE_RTCP_FB_NACK,
    ] {
        media.register_feedback(
            RTCPFeedback {
                typ: typ.to_owned(),
                parameter: String::new(),
            },
            RTPCodecType::Video,
        );
    }

    for uri in SIMULCAST_HEADER_EXTENSIONS {
        media
            .register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: uri.to_owned(),
                },
                RTPCodecType::Video,
                None,
            )
            .ok();
    }

    let mut setting_engine = SettingEngine::default();
    setting_engine.set_lite(true);
    setting_engine.set_network_types(vec![NetworkType::Udp4]);
    if config.port_max > 0 {
        match EphemeralUDP::new(config.port_min, config.port_max) {
            Ok(udp) => setting_engine.set_udp_network(UDPNetwork::Ephemeral(udp)),
            Err(err) => warn!(%err, "invalid udp port range, keeping ephemeral defaults"),
        }
    }
    if !config.public_ip.is_empty() {
        setting_engine.set_nat_1to1_ips(
            vec![config.public_ip.clone()],
            RTCIceCandidateType::Host,
        );
    }

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media).map_err(ParticipantError::CreatePeer)?;

    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_setting_engine(setting_engine)
        .with_interceptor_registry(registry)
        .build();

    let peer = api
        .new_peer_connection(rtc_config)
        .await
        .map_err(ParticipantError::CreatePeer)?;

    Ok(Arc::new(peer))
}

/// One half of the participant's transport pair, with offer/answer helpers
/// that tag failures with the phase they occurred in.
pub struct PeerTransport {
    pc: Arc<RTCPeerConnection>,
    target: SignalTarget,
}

impl PeerTransport {
    pub fn new(pc: Arc<RTCPeerConnection>, target: SignalTarget) -> Self {
        Self { pc, target }
    }

    #[inline]
    pub fn pc(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    #[inline]
    pub fn target(&self) -> SignalTarget {
        self.target
    }

    #[inline]
    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    pub async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    pub async fn set_remote_description(
        &self,
        sdp: RTCSessionDescription,
    ) -> Result<(), ParticipantError> {
        self.pc
            .set_remote_description(sdp)
            .await
            .map_err(|source| self.transport_err("set_remote_description", source))
    }

    pub async fn create_and_set_answer(&self) -> Result<RTCSessionDescription, ParticipantError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|source| self.transport_err("create_answer", source))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|source| self.transport_err("set_local_description", source))?;

        Ok(answer)
    }

    pub async fn create_and_set_offer(
        &self,
        ice_restart: bool,
    ) -> Result<RTCSessionDescription, ParticipantError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|source| self.transport_err("create_offer", source))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|source| self.transport_err("set_local_description", source))?;

        Ok(offer)
    }

    pub async fn add_ice_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), ParticipantError> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|source| self.transport_err("add_ice_candidate", source))
    }

    pub async fn close(&self) -> Result<(), webrtc::Error> {
        self.pc.close().await
    }

    fn transport_err(&self, phase: &'static str, source: webrtc::Error) -> ParticipantError {
        ParticipantError::Transport {
            phase,
            target: self.target,
            source,
        }
    }
}
