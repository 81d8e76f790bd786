use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nanoid::nanoid;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtcp::source_description::SourceDescriptionChunk;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::entities::data_channel::DataChannelSet;
use crate::entities::media_track::{
    MediaTrack, MediaTrackFactory, MediaTrackParams, TwccResponder, TwccResponderFactory,
};
use crate::entities::subscribed_track::{ForwardingStatus, SubscribedTrack};
use crate::entities::transport::{PeerTransport, new_peer_connection};
use crate::errors::ParticipantError;
use crate::models::ParticipantParams;
use crate::models::data_packet::{DataPacket, DataPacketKind, DataPacketValue};
use crate::models::info::{
    AddTrackRequest, IceServerInfo, ParticipantInfo, ParticipantPermission, ProtocolVersion,
    RoomInfo, SpeakerInfo, TrackInfo, TrackType,
};
use crate::models::quality::{ConnectionQuality, ConnectionQualityInfo};
use crate::models::signal::{SignalMessage, SignalSink, SignalTarget};
use crate::models::state::ParticipantState;
use crate::services::dtx;
use crate::services::pli_throttle::PliThrottle;
use crate::services::rtcp_router::{self, RTCP_CHANNEL_DEPTH, RtcpBatch};
use crate::services::update_cache::UpdateCache;

/// Audio level reported when no track is speaking. Lower values are louder.
pub const SILENT_AUDIO_LEVEL: u8 = 127;

const UPDATE_CACHE_SIZE: usize = 32;

const NEGOTIATION_DEBOUNCE: Duration = Duration::from_millis(100);

pub type TrackCallback = Arc<dyn Fn(Arc<Participant>, Arc<dyn MediaTrack>) + Send + Sync>;
pub type StateChangeCallback = Arc<dyn Fn(Arc<Participant>, ParticipantState) + Send + Sync>;
pub type DataPacketCallback = Arc<dyn Fn(Arc<Participant>, DataPacket) + Send + Sync>;
pub type ParticipantCallback = Arc<dyn Fn(Arc<Participant>) + Send + Sync>;

#[derive(Default)]
struct ObserverRegistry {
    on_track_published: Option<TrackCallback>,
    on_track_updated: Option<TrackCallback>,
    on_state_change: Option<StateChangeCallback>,
    on_data_packet: Option<DataPacketCallback>,
    on_close: Option<ParticipantCallback>,
    on_metadata_update: Option<ParticipantCallback>,
}

/// Everything guarded by the participant's main lock. Callbacks are cloned
/// out under the lock and fired after release.
struct Inner {
    pending_tracks: HashMap<String, TrackInfo>,
    published_tracks: HashMap<String, Arc<dyn MediaTrack>>,
    subscribed_tracks: HashMap<String, SubscribedTrack>,
    observers: ObserverRegistry,
    twcc: Option<Arc<dyn TwccResponder>>,
}

/// The server-side peer of one conference member. Owns the publisher and
/// subscriber peer connections, reconciles announced tracks with incoming
/// media, routes RTCP between the two legs and multiplexes signaling over
/// the sink.
pub struct Participant {
    sid: String,
    identity: String,
    connected_at: DateTime<Utc>,
    protocol: ProtocolVersion,
    permission: ParticipantPermission,
    hidden: bool,
    subscriber_primary: bool,

    state: AtomicU8,
    is_closed: AtomicBool,
    negotiation_pending: AtomicBool,
    start_once: Once,
    cancel: CancellationToken,

    metadata: RwLock<String>,
    sink: RwLock<Option<Arc<dyn SignalSink>>>,
    lock: RwLock<Inner>,
    update_lock: tokio::sync::Mutex<UpdateCache>,
    subscribed_to: DashMap<String, ()>,

    publisher: PeerTransport,
    subscriber: PeerTransport,
    data_channels: DataChannelSet,

    rtcp_tx: mpsc::Sender<RtcpBatch>,
    rtcp_rx: Mutex<Option<mpsc::Receiver<RtcpBatch>>>,
    pli_throttle: PliThrottle,

    media_factory: MediaTrackFactory,
    twcc_factory: TwccResponderFactory,
}

impl Participant {
    pub async fn new(params: ParticipantParams) -> Result<Arc<Self>, ParticipantError> {
        if params.identity.is_empty() {
            return Err(ParticipantError::MissingIdentity);
        }

        let publisher_pc = new_peer_connection(&params.rtc).await?;
        let subscriber_pc = new_peer_connection(&params.rtc).await?;

        let permission = params.permission.unwrap_or_default();
        let subscriber_primary =
            params.protocol_version.subscriber_as_primary() && permission.can_subscribe;

        let (rtcp_tx, rtcp_rx) = mpsc::channel(RTCP_CHANNEL_DEPTH);

        let participant = Arc::new(Self {
            sid: format!("PA_{}", nanoid!(12)),
            identity: params.identity,
            connected_at: Utc::now(),
            protocol: params.protocol_version,
            permission,
            hidden: params.hidden,
            subscriber_primary,
            state: AtomicU8::new(ParticipantState::Joining.as_u8()),
            is_closed: AtomicBool::new(false),
            negotiation_pending: AtomicBool::new(false),
            start_once: Once::new(),
            cancel: CancellationToken::new(),
            metadata: RwLock::new(params.metadata),
            sink: RwLock::new(Some(params.sink)),
            lock: RwLock::new(Inner {
                pending_tracks: HashMap::new(),
                published_tracks: HashMap::new(),
                subscribed_tracks: HashMap::new(),
                observers: ObserverRegistry::default(),
                twcc: None,
            }),
            update_lock: tokio::sync::Mutex::new(UpdateCache::new(UPDATE_CACHE_SIZE)),
            subscribed_to: DashMap::new(),
            publisher: PeerTransport::new(publisher_pc, SignalTarget::Publisher),
            subscriber: PeerTransport::new(subscriber_pc, SignalTarget::Subscriber),
            data_channels: DataChannelSet::new(subscriber_primary),
            rtcp_tx,
            rtcp_rx: Mutex::new(Some(rtcp_rx)),
            pli_throttle: PliThrottle::new(params.pli_throttle),
            media_factory: params.media_factory,
            twcc_factory: params.twcc_factory,
        });

        if subscriber_primary {
            participant
                .data_channels
                .create_subscriber_channels(participant.subscriber.pc())
                .await
                .map_err(|source| ParticipantError::Transport {
                    phase: "create_data_channel",
                    target: SignalTarget::Subscriber,
                    source,
                })?;
        }

        participant.register_transport_callbacks();

        Ok(participant)
    }

    /// Spawns the RTCP workers. Safe to call more than once; only the first
    /// call has any effect.
    pub fn start(self: &Arc<Self>) {
        self.start_once.call_once(|| {
            if let Some(rx) = self.rtcp_rx.lock().take() {
                tokio::spawn(rtcp_router::publisher_rtcp_worker(
                    Arc::downgrade(self),
                    rx,
                    self.cancel.clone(),
                ));
            }
            tokio::spawn(rtcp_router::subscriber_rtcp_worker(
                Arc::downgrade(self),
                self.cancel.clone(),
            ));
        });
    }

    // === Identity & state ===

    #[inline]
    pub fn sid(&self) -> &str {
        &self.sid
    }

    #[inline]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[inline]
    pub fn state(&self) -> ParticipantState {
        ParticipantState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    /// A participant is ready once its first answer went out.
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(
            self.state(),
            ParticipantState::Joined | ParticipantState::Active
        )
    }

    #[inline]
    pub fn hidden(&self) -> bool {
        self.hidden
    }

    #[inline]
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol
    }

    #[inline]
    pub fn subscriber_as_primary(&self) -> bool {
        self.subscriber_primary
    }

    #[inline]
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    #[inline]
    pub fn can_publish(&self) -> bool {
        self.permission.can_publish
    }

    #[inline]
    pub fn can_subscribe(&self) -> bool {
        self.permission.can_subscribe
    }

    #[inline]
    pub fn can_publish_data(&self) -> bool {
        self.permission.can_publish_data
    }

    pub fn metadata(&self) -> String {
        self.metadata.read().clone()
    }

    /// Last-write-wins metadata update; observers are notified.
    pub fn set_metadata(self: &Arc<Self>, metadata: String) {
        *self.metadata.write() = metadata;
        let callback = self.lock.read().observers.on_metadata_update.clone();
        if let Some(callback) = callback {
            callback(self.clone());
        }
    }

    pub fn to_proto(&self) -> ParticipantInfo {
        let tracks = {
            let inner = self.lock.read();
            inner
                .published_tracks
                .values()
                .map(|track| track.to_proto())
                .collect()
        };
        ParticipantInfo {
            sid: self.sid.clone(),
            identity: self.identity.clone(),
            state: self.state(),
            tracks,
            metadata: self.metadata(),
            joined_at: self.connected_at.timestamp(),
            hidden: self.hidden,
        }
    }

    // === Observers ===

    pub fn on_track_published(&self, callback: TrackCallback) {
        self.lock.write().observers.on_track_published = Some(callback);
    }

    pub fn on_track_updated(&self, callback: TrackCallback) {
        self.lock.write().observers.on_track_updated = Some(callback);
    }

    pub fn on_state_change(&self, callback: StateChangeCallback) {
        self.lock.write().observers.on_state_change = Some(callback);
    }

    pub fn on_data_packet(&self, callback: DataPacketCallback) {
        self.lock.write().observers.on_data_packet = Some(callback);
    }

    pub fn on_close(&self, callback: ParticipantCallback) {
        self.lock.write().observers.on_close = Some(callback);
    }

    pub fn on_metadata_update(&self, callback: ParticipantCallback) {
        self.lock.write().observers.on_metadata_update = Some(callback);
    }

    // === Signaling ===

    /// Replaces the signaling sink, e.g. after a reconnect.
    pub fn set_response_sink(&self, sink: Arc<dyn SignalSink>) {
        *self.sink.write() = Some(sink);
    }

    async fn write_message(&self, msg: SignalMessage) -> Result<(), ParticipantError> {
        if self.state() == ParticipantState::Disconnected {
            return Ok(());
        }
        let sink = self.sink.read().clone();
        let Some(sink) = sink else {
            return Ok(());
        };

        let kind = msg.kind();
        if let Err(cause) = sink.write_message(msg).await {
            warn!(kind, %cause, "failed to write signal message");
            return Err(ParticipantError::Delivery { kind, cause });
        }
        Ok(())
    }

    pub async fn send_join_response(
        &self,
        room: RoomInfo,
        other_participants: Vec<ParticipantInfo>,
        server_version: &str,
        ice_servers: Vec<IceServerInfo>,
    ) -> Result<(), ParticipantError> {
        self.write_message(SignalMessage::Join {
            room,
            participant: self.to_proto(),
            other_participants,
            server_version: server_version.to_owned(),
            ice_servers,
            subscriber_primary: self.subscriber_primary,
        })
        .await
    }

    /// Sends a peer-state update. Single-peer batches are checked against the
    /// update cache and silently dropped when they arrive out of order.
    pub async fn send_participant_update(
        &self,
        participants: Vec<ParticipantInfo>,
        updated_at: DateTime<Utc>,
    ) -> Result<(), ParticipantError> {
        let mut cache = self.update_lock.lock().await;
        if participants.len() == 1 {
            let peer = &participants[0];
            if cache.is_stale(&peer.sid, updated_at) {
                debug!(peer = %peer.sid, "dropping out-of-order participant update");
                return Ok(());
            }
        }
        self.write_message(SignalMessage::Update { participants })
            .await
    }

    pub async fn send_speakers_changed(
        &self,
        speakers: Vec<SpeakerInfo>,
    ) -> Result<(), ParticipantError> {
        self.write_message(SignalMessage::SpeakersChanged { speakers })
            .await
    }

    pub async fn send_room_update(&self, room: RoomInfo) -> Result<(), ParticipantError> {
        self.write_message(SignalMessage::RoomUpdate { room }).await
    }

    pub async fn send_connection_quality_update(
        &self,
        updates: Vec<ConnectionQualityInfo>,
    ) -> Result<(), ParticipantError> {
        self.write_message(SignalMessage::ConnectionQuality { updates })
            .await
    }

    pub async fn send_streamed_tracks_update(
        &self,
        paused: Vec<String>,
        resumed: Vec<String>,
    ) -> Result<(), ParticipantError> {
        self.write_message(SignalMessage::StreamedTracksUpdate { paused, resumed })
            .await
    }

    // === Offer / answer ===

    /// Applies a publisher offer and responds with an answer. The first
    /// successful answer moves the participant from Joining to Joined.
    pub async fn handle_offer(
        self: &Arc<Self>,
        sdp: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, ParticipantError> {
        self.publisher.set_remote_description(sdp).await?;

        let pending_audio = {
            let inner = self.lock.read();
            inner
                .pending_tracks
                .values()
                .find(|info| info.kind == TrackType::Audio)
                .cloned()
        };
        if let Err(err) = dtx::configure_receiver_dtx(self.publisher.pc(), pending_audio).await {
            warn!(%err, "failed to configure opus dtx");
        }

        let answer = self.publisher.create_and_set_answer().await?;

        self.write_message(SignalMessage::Answer {
            sdp: answer.clone(),
        })
        .await?;

        if self.state() == ParticipantState::Joining {
            self.update_state(ParticipantState::Joined);
        }

        Ok(answer)
    }

    /// Applies the client's answer to a subscriber offer.
    pub async fn handle_answer(
        &self,
        sdp: RTCSessionDescription,
    ) -> Result<(), ParticipantError> {
        if sdp.sdp_type != RTCSdpType::Answer {
            return Err(ParticipantError::UnexpectedOffer);
        }
        self.subscriber.set_remote_description(sdp).await
    }

    pub async fn add_ice_candidate(
        &self,
        candidate: RTCIceCandidateInit,
        target: SignalTarget,
    ) -> Result<(), ParticipantError> {
        match target {
            SignalTarget::Publisher => self.publisher.add_ice_candidate(candidate).await,
            SignalTarget::Subscriber => self.subscriber.add_ice_candidate(candidate).await,
        }
    }

    /// Creates a fresh subscriber offer and sends it to the client.
    pub async fn negotiate(&self) -> Result<(), ParticipantError> {
        if self.state() == ParticipantState::Disconnected {
            return Ok(());
        }
        let offer = self.subscriber.create_and_set_offer(false).await?;
        self.write_message(SignalMessage::Offer { sdp: offer }).await
    }

    /// Restarts ICE on the subscriber connection. A no-op until the
    /// subscriber has completed at least one negotiation.
    pub async fn ice_restart(&self) -> Result<(), ParticipantError> {
        if !self.subscriber.has_remote_description().await {
            debug!(sid = %self.sid, "skipping ice restart, no remote description yet");
            return Ok(());
        }
        let offer = self.subscriber.create_and_set_offer(true).await?;
        self.write_message(SignalMessage::Offer { sdp: offer }).await
    }

    // === Track publication ===

    /// Handles a client's announcement of a track it is about to publish.
    /// Confirms the server-assigned sid back to the client.
    pub async fn add_track(self: &Arc<Self>, req: AddTrackRequest) -> Result<(), ParticipantError> {
        let track = {
            let mut inner = self.lock.write();

            let duplicate = inner.pending_tracks.contains_key(&req.cid)
                || inner
                    .published_tracks
                    .values()
                    .any(|t| t.signal_cid() == req.cid || t.sdp_cid() == req.cid);
            if duplicate {
                debug!(cid = %req.cid, "track already pending or published");
                return Ok(());
            }

            if !self.permission.can_publish {
                warn!(identity = %self.identity, cid = %req.cid, "rejecting track publication, no permission");
                return Ok(());
            }

            let info = TrackInfo {
                sid: format!("TR_{}", nanoid!(12)),
                kind: req.kind,
                name: req.name,
                muted: req.muted,
                width: req.width,
                height: req.height,
                disable_dtx: req.disable_dtx,
                source: req.source,
            };
            inner.pending_tracks.insert(req.cid.clone(), info.clone());
            info
        };

        self.write_message(SignalMessage::TrackPublished {
            cid: req.cid,
            track,
        })
        .await
    }

    /// Publisher peer connection delivered an RTP track.
    pub(crate) async fn on_media_track(
        self: &Arc<Self>,
        track: Arc<TrackRemote>,
        receiver: Arc<RTCRtpReceiver>,
    ) {
        let sdp_cid = track.id();
        let kind = TrackType::from(track.kind());
        let ssrc = track.ssrc();
        let rid = track.rid().to_string();

        let Some((media_track, is_new)) = self.reconcile_media_track(sdp_cid, kind, ssrc, &rid)
        else {
            return;
        };

        media_track.add_receiver(receiver, track).await;

        if is_new {
            self.handle_track_published(media_track.clone());
            media_track.start().await;
        }
    }

    /// Matches incoming media against published and pending tracks. Returns
    /// the owning media track and whether it was newly created.
    pub(crate) fn reconcile_media_track(
        &self,
        sdp_cid: String,
        kind: TrackType,
        ssrc: u32,
        rid: &str,
    ) -> Option<(Arc<dyn MediaTrack>, bool)> {
        if self.state() == ParticipantState::Disconnected || !self.permission.can_publish {
            return None;
        }

        let mut inner = self.lock.write();

        // Another layer of a track that already published under this sdp cid.
        if let Some(existing) = inner
            .published_tracks
            .values()
            .find(|t| t.sdp_cid() == sdp_cid)
        {
            self.pli_throttle.add_track(ssrc, rid);
            return Some((existing.clone(), false));
        }

        // The client's MediaStreamTrack id can change between AddTrack and
        // the renegotiated SDP, so fall back to the first pending track of
        // the same kind.
        let signal_cid = if inner.pending_tracks.contains_key(&sdp_cid) {
            sdp_cid.clone()
        } else {
            match inner
                .pending_tracks
                .iter()
                .find(|(_, info)| info.kind == kind)
                .map(|(cid, _)| cid.clone())
            {
                Some(cid) => cid,
                None => {
                    warn!(cid = %sdp_cid, ?kind, "no pending track matches incoming media");
                    return None;
                }
            }
        };

        let Some(info) = inner.pending_tracks.remove(&signal_cid) else {
            return None;
        };

        let twcc = match inner.twcc.clone() {
            Some(twcc) => twcc,
            None => {
                let twcc = self.create_twcc_responder(ssrc);
                inner.twcc = Some(twcc.clone());
                twcc
            }
        };

        let media_track = (self.media_factory)(MediaTrackParams {
            track_info: info.clone(),
            signal_cid,
            sdp_cid,
            participant_sid: self.sid.clone(),
            participant_identity: self.identity.clone(),
            rtcp_sender: self.rtcp_tx.clone(),
            twcc,
        });

        inner
            .published_tracks
            .insert(info.sid.clone(), media_track.clone());
        self.pli_throttle.add_track(ssrc, rid);

        info!(sid = %self.sid, track = %info.sid, ?kind, "track published");
        Some((media_track, true))
    }

    /// Only one responder exists per participant; the first published track
    /// wins and its feedback goes to the publisher peer connection.
    fn create_twcc_responder(&self, ssrc: u32) -> Arc<dyn TwccResponder> {
        let responder = (self.twcc_factory)(ssrc);
        let pc = Arc::downgrade(self.publisher.pc());
        responder.on_feedback(Box::new(move |packet| {
            let pc = pc.clone();
            tokio::spawn(async move {
                if let Some(pc) = pc.upgrade() {
                    if let Err(err) = pc.write_rtcp(&[packet]).await {
                        debug!(%err, "failed to write twcc feedback");
                    }
                }
            });
        }));
        responder
    }

    /// Fires the published observer and arms the close hook that retires the
    /// track.
    pub(crate) fn handle_track_published(self: &Arc<Self>, media_track: Arc<dyn MediaTrack>) {
        let callback = self.lock.read().observers.on_track_published.clone();
        if let Some(callback) = callback {
            callback(self.clone(), media_track.clone());
        }

        let weak = Arc::downgrade(self);
        let weak_track = Arc::downgrade(&media_track);
        let sid = media_track.sid();
        media_track.on_close(Box::new(move || {
            let Some(participant) = weak.upgrade() else {
                return;
            };
            let callback = {
                let mut inner = participant.lock.write();
                inner.published_tracks.remove(&sid);
                inner.observers.on_track_updated.clone()
            };
            if participant.is_ready() {
                if let (Some(callback), Some(track)) = (callback, weak_track.upgrade()) {
                    callback(participant.clone(), track);
                }
            }
        }));
    }

    /// Applies a mute change to a pending or published track. Admin-driven
    /// changes are echoed to the client so it can mirror the state.
    pub async fn set_track_muted(self: &Arc<Self>, sid: &str, muted: bool, from_admin: bool) {
        let fired = {
            let mut inner = self.lock.write();
            if let Some(info) = inner.pending_tracks.values_mut().find(|t| t.sid == sid) {
                info.muted = muted;
                None
            } else if let Some(track) = inner.published_tracks.get(sid).cloned() {
                let changed = track.is_muted() != muted;
                track.set_muted(muted);
                if changed {
                    inner
                        .observers
                        .on_track_updated
                        .clone()
                        .map(|callback| (callback, track))
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some((callback, track)) = fired {
            callback(self.clone(), track);
        }

        if from_admin {
            let _ = self
                .write_message(SignalMessage::Mute {
                    sid: sid.to_owned(),
                    muted,
                })
                .await;
        }
    }

    pub fn get_published_track(&self, sid: &str) -> Option<Arc<dyn MediaTrack>> {
        self.lock.read().published_tracks.get(sid).cloned()
    }

    pub fn get_published_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.lock.read().published_tracks.values().cloned().collect()
    }

    // === Subscriptions ===

    /// Attaches every published track to `subscriber`. Returns how many
    /// tracks were handed over.
    pub async fn add_subscriber(
        &self,
        subscriber: Arc<Participant>,
    ) -> Result<usize, anyhow::Error> {
        let tracks = self.get_published_tracks();
        if tracks.is_empty() {
            return Ok(0);
        }

        let n = tracks.len();
        for track in tracks {
            track.add_subscriber(subscriber.clone()).await?;
        }
        debug!(publisher = %self.identity, subscriber = %subscriber.identity(), count = n, "subscriber added");
        Ok(n)
    }

    pub fn add_subscribed_track(self: &Arc<Self>, track: SubscribedTrack) {
        {
            let mut inner = self.lock.write();
            self.subscribed_to
                .insert(track.publisher_identity.clone(), ());
            inner
                .subscribed_tracks
                .insert(track.track_sid.clone(), track);
        }
        self.schedule_negotiate();
    }

    /// Drops a subscribed track; the publisher leaves `subscribed_to` only
    /// when no other track of theirs remains.
    pub fn remove_subscribed_track(self: &Arc<Self>, publisher_identity: &str, track_sid: &str) {
        {
            let mut inner = self.lock.write();
            inner.subscribed_tracks.remove(track_sid);
            let remaining = inner
                .subscribed_tracks
                .values()
                .filter(|t| t.publisher_identity == publisher_identity)
                .count();
            if remaining == 0 {
                self.subscribed_to.remove(publisher_identity);
            }
        }
        self.schedule_negotiate();
    }

    pub fn is_subscribed_to(&self, identity: &str) -> bool {
        self.subscribed_to.contains_key(identity)
    }

    pub fn subscribed_identities(&self) -> Vec<String> {
        self.subscribed_to
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub(crate) fn collect_subscriber_reports(
        &self,
    ) -> (Vec<SenderReport>, Vec<SourceDescriptionChunk>) {
        let inner = self.lock.read();
        let mut srs = Vec::new();
        let mut chunks = Vec::new();
        for track in inner.subscribed_tracks.values() {
            if let Some(sr) = track.down_track.create_sender_report() {
                srs.push(sr);
            }
            if let Some(mut sdes) = track.down_track.create_source_description_chunks() {
                chunks.append(&mut sdes);
            }
        }
        (srs, chunks)
    }

    // === Data channels ===

    /// Sends a data packet to this participant over the channel matching its
    /// reliability class.
    pub async fn send_data_packet(&self, packet: DataPacket) -> Result<(), ParticipantError> {
        if self.state() != ParticipantState::Active {
            return Err(ParticipantError::DataChannelUnavailable);
        }
        let Some(dc) = self.data_channels.outbound(packet.kind) else {
            return Err(ParticipantError::DataChannelUnavailable);
        };

        let payload = serde_json::to_vec(&packet)?;
        dc.send(&Bytes::from(payload))
            .await
            .map_err(ParticipantError::DataChannelSend)?;
        Ok(())
    }

    fn on_data_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let Some(kind) = self.data_channels.latch_inbound(&dc) else {
            return;
        };

        let weak = Arc::downgrade(self);
        dc.on_message(Box::new(move |msg| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(participant) = weak.upgrade() {
                    participant.handle_data_message(kind, &msg.data);
                }
            })
        }));
    }

    /// Decodes an inbound packet. The channel it arrived on decides the kind;
    /// only user payloads are forwarded, stamped with this participant's sid.
    pub(crate) fn handle_data_message(self: &Arc<Self>, kind: DataPacketKind, data: &[u8]) {
        if !self.permission.can_publish_data {
            warn!(identity = %self.identity, "dropping data packet, no publish permission");
            return;
        }

        let mut packet: DataPacket = match serde_json::from_slice(data) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(%err, "failed to decode data packet");
                return;
            }
        };
        packet.kind = kind;

        match &mut packet.value {
            DataPacketValue::User(user) => {
                user.participant_sid = self.sid.clone();
            }
            _ => {
                debug!("ignoring unsupported data packet payload");
                return;
            }
        }

        let callback = self.lock.read().observers.on_data_packet.clone();
        if let Some(callback) = callback {
            callback(self.clone(), packet);
        }
    }

    // === Quality & audio ===

    pub fn get_connection_quality(&self) -> ConnectionQualityInfo {
        let (pub_loss, reduced_pub, sub_loss, reduced_sub) = {
            let inner = self.lock.read();

            let mut total = 0u32;
            let mut count = 0u32;
            let mut reduced_pub = false;
            for track in inner.published_tracks.values() {
                if track.is_muted() {
                    continue;
                }
                count += 1;
                total += track.publish_loss_percentage();
                let (publishing, registered) = track.num_up_tracks();
                if registered > 0 && publishing != registered {
                    reduced_pub = true;
                }
            }
            let pub_loss = if count > 0 { total as f32 / count as f32 } else { 0.0 };

            let mut total = 0u32;
            let mut count = 0u32;
            let mut reduced_sub = false;
            for track in inner.subscribed_tracks.values() {
                if track.is_muted() {
                    continue;
                }
                count += 1;
                total += track.subscribe_loss_percentage();
                if track.down_track.forwarding_status() != ForwardingStatus::Optimal {
                    reduced_sub = true;
                }
            }
            let sub_loss = if count > 0 { total as f32 / count as f32 } else { 0.0 };

            (pub_loss, reduced_pub, sub_loss, reduced_sub)
        };

        let avg = (pub_loss + sub_loss) / 2.0;
        ConnectionQualityInfo {
            participant_sid: self.sid.clone(),
            quality: ConnectionQuality::rate(avg, reduced_pub, reduced_sub),
        }
    }

    /// Loudest active level across published audio tracks.
    pub fn get_audio_level(&self) -> (u8, bool) {
        let mut level = SILENT_AUDIO_LEVEL;
        let mut active = false;

        let inner = self.lock.read();
        for track in inner.published_tracks.values() {
            if track.kind() != TrackType::Audio {
                continue;
            }
            if let Some((track_level, track_active)) = track.audio_level() {
                if track_active {
                    active = true;
                    if track_level < level {
                        level = track_level;
                    }
                }
            }
        }
        (level, active)
    }

    pub fn debug_info(&self) -> serde_json::Value {
        let inner = self.lock.read();
        serde_json::json!({
            "sid": self.sid,
            "identity": self.identity,
            "state": format!("{:?}", self.state()),
            "pendingTracks": inner.pending_tracks,
            "publishedTracks": inner
                .published_tracks
                .values()
                .map(|t| t.to_proto())
                .collect::<Vec<_>>(),
            "subscribedTracks": inner
                .subscribed_tracks
                .values()
                .map(|t| serde_json::json!({
                    "trackSid": t.track_sid,
                    "publisherIdentity": t.publisher_identity,
                    "downTrack": t.down_track.debug_info(),
                }))
                .collect::<Vec<_>>(),
        })
    }

    // === Lifecycle ===

    /// Tears the participant down. Idempotent; concurrent calls perform the
    /// side effects exactly once.
    pub async fn close(self: &Arc<Self>) {
        if self.is_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(sid = %self.sid, identity = %self.identity, "closing participant");

        let _ = self.write_message(SignalMessage::Leave).await;

        let published = self.get_published_tracks();
        for track in published {
            track.remove_all_subscribers().await;
        }

        // DownTracks close outside the lock: their close handlers may call
        // back into this participant.
        let down_tracks: Vec<_> = {
            let mut inner = self.lock.write();
            inner.pending_tracks.clear();
            inner
                .subscribed_tracks
                .drain()
                .map(|(_, track)| track.down_track)
                .collect()
        };
        self.subscribed_to.clear();
        for down_track in down_tracks {
            down_track.close();
        }

        self.update_state(ParticipantState::Disconnected);

        let sink = self.sink.write().take();
        if let Some(sink) = sink {
            sink.close().await;
        }

        let on_close = self.lock.read().observers.on_close.clone();
        if let Some(callback) = on_close {
            let participant = self.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(participant))).is_err() {
                warn!(sid = %self.sid, "close observer panicked");
            }
        }

        if let Err(err) = self.publisher.close().await {
            warn!(%err, "failed to close publisher peer connection");
        }
        if let Err(err) = self.subscriber.close().await {
            warn!(%err, "failed to close subscriber peer connection");
        }

        self.cancel.cancel();
    }

    /// Moves the lifecycle forward; regressions are no-ops. The state-change
    /// observer runs on its own task with the old state.
    pub(crate) fn update_state(self: &Arc<Self>, new_state: ParticipantState) {
        let mut old = self.state.load(Ordering::Acquire);
        loop {
            if new_state.as_u8() <= old {
                return;
            }
            match self.state.compare_exchange(
                old,
                new_state.as_u8(),
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => old = actual,
            }
        }

        let old_state = ParticipantState::from(old);
        info!(sid = %self.sid, from = ?old_state, to = ?new_state, "participant state changed");

        let callback = self.lock.read().observers.on_state_change.clone();
        if let Some(callback) = callback {
            let participant = self.clone();
            tokio::spawn(async move {
                if catch_unwind(AssertUnwindSafe(|| callback(participant, old_state))).is_err() {
                    warn!("state change observer panicked");
                }
            });
        }
    }

    // === Transport callbacks ===

    pub(crate) fn pli_throttle(&self) -> &PliThrottle {
        &self.pli_throttle
    }

    pub(crate) fn publisher(&self) -> &PeerTransport {
        &self.publisher
    }

    pub(crate) fn subscriber(&self) -> &PeerTransport {
        &self.subscriber
    }

    fn register_transport_callbacks(self: &Arc<Self>) {
        for target in [SignalTarget::Publisher, SignalTarget::Subscriber] {
            let transport = match target {
                SignalTarget::Publisher => &self.publisher,
                SignalTarget::Subscriber => &self.subscriber,
            };
            let weak = Arc::downgrade(self);
            transport.pc().on_ice_candidate(Box::new(move |candidate| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    let Some(participant) = weak.upgrade() else {
                        return;
                    };
                    participant.handle_outgoing_trickle(candidate, target).await;
                })
            }));
        }

        let primary = if self.subscriber_primary {
            &self.subscriber
        } else {
            &self.publisher
        };
        let weak = Arc::downgrade(self);
        primary
            .pc()
            .on_ice_connection_state_change(Box::new(move |state| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(participant) = weak.upgrade() {
                        participant.handle_primary_ice_state(state);
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.publisher
            .pc()
            .on_track(Box::new(move |track, receiver, _transceiver| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(participant) = weak.upgrade() {
                        participant.on_media_track(track, receiver).await;
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.publisher.pc().on_data_channel(Box::new(move |dc| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(participant) = weak.upgrade() {
                    participant.on_data_channel(dc);
                }
            })
        }));

        let weak = Arc::downgrade(self);
        self.subscriber
            .pc()
            .on_negotiation_needed(Box::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(participant) = weak.upgrade() else {
                        return;
                    };
                    if participant.state() == ParticipantState::Disconnected {
                        return;
                    }
                    participant.schedule_negotiate();
                })
            }));
    }

    async fn handle_outgoing_trickle(&self, candidate: RTCIceCandidate, target: SignalTarget) {
        if self.state() == ParticipantState::Disconnected {
            return;
        }
        let init = match candidate.to_json() {
            Ok(init) => init,
            Err(err) => {
                warn!(%err, "failed to serialize ice candidate");
                return;
            }
        };
        let candidate_init = match serde_json::to_string(&init) {
            Ok(candidate_init) => candidate_init,
            Err(err) => {
                warn!(%err, "failed to encode ice candidate");
                return;
            }
        };
        let _ = self
            .write_message(SignalMessage::Trickle {
                target,
                candidate_init,
            })
            .await;
    }

    /// ICE on the primary connection drives the lifecycle: Connected makes
    /// the participant Active, Failed tears it down. The close runs on its
    /// own task to keep out of the ICE agent's callback.
    pub(crate) fn handle_primary_ice_state(self: &Arc<Self>, state: RTCIceConnectionState) {
        debug!(sid = %self.sid, ?state, "primary ice connection state changed");
        match state {
            RTCIceConnectionState::Connected => self.update_state(ParticipantState::Active),
            RTCIceConnectionState::Failed => {
                warn!(sid = %self.sid, "primary ice connection failed, closing participant");
                let participant = self.clone();
                tokio::spawn(async move {
                    participant.close().await;
                });
            }
            _ => {}
        }
    }

    /// Coalesces bursts of renegotiation triggers into a single offer.
    fn schedule_negotiate(self: &Arc<Self>) {
        if self.negotiation_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(NEGOTIATION_DEBOUNCE).await;
            let Some(participant) = weak.upgrade() else {
                return;
            };
            participant
                .negotiation_pending
                .store(false, Ordering::SeqCst);
            if participant.state() == ParticipantState::Disconnected {
                return;
            }
            if let Err(err) = participant.negotiate().await {
                warn!(%err, "scheduled negotiation failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::media_track::{OnTrackClose, TwccOnFeedback};
    use crate::entities::subscribed_track::DownTrack;
    use crate::models::info::TrackSource;
    use crate::models::{PliThrottleConfig, WebRtcConfig};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;
    use webrtc::api::APIBuilder;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    struct RecordingSink {
        messages: Mutex<Vec<SignalMessage>>,
        closed: AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
                closed: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.messages.lock().len()
        }

        fn count_kind(&self, kind: &str) -> usize {
            self.messages
                .lock()
                .iter()
                .filter(|msg| msg.kind() == kind)
                .count()
        }

        fn published_track_sid(&self) -> Option<String> {
            self.messages.lock().iter().find_map(|msg| match msg {
                SignalMessage::TrackPublished { track, .. } => Some(track.sid.clone()),
                _ => None,
            })
        }
    }

    #[async_trait]
    impl SignalSink for RecordingSink {
        async fn write_message(&self, msg: SignalMessage) -> Result<(), anyhow::Error> {
            self.messages.lock().push(msg);
            Ok(())
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeMediaTrack {
        info: Mutex<TrackInfo>,
        signal_cid: String,
        sdp_cid: String,
        muted: AtomicBool,
        loss: u32,
        up_tracks: (u32, u32),
        audio: Option<(u8, bool)>,
        close_hooks: Mutex<Vec<OnTrackClose>>,
        started: AtomicUsize,
        removed_all: AtomicUsize,
    }

    impl FakeMediaTrack {
        fn from_params(params: MediaTrackParams) -> Self {
            Self {
                muted: AtomicBool::new(params.track_info.muted),
                info: Mutex::new(params.track_info),
                signal_cid: params.signal_cid,
                sdp_cid: params.sdp_cid,
                loss: 0,
                up_tracks: (0, 0),
                audio: None,
                close_hooks: Mutex::new(Vec::new()),
                started: AtomicUsize::new(0),
                removed_all: AtomicUsize::new(0),
            }
        }

        fn plain(sid: &str, kind: TrackType) -> Self {
            Self {
                info: Mutex::new(TrackInfo {
                    sid: sid.to_owned(),
                    kind,
                    name: sid.to_owned(),
                    muted: false,
                    width: 0,
                    height: 0,
                    disable_dtx: false,
                    source: TrackSource::Camera,
                }),
                signal_cid: sid.to_owned(),
                sdp_cid: sid.to_owned(),
                muted: AtomicBool::new(false),
                loss: 0,
                up_tracks: (0, 0),
                audio: None,
                close_hooks: Mutex::new(Vec::new()),
                started: AtomicUsize::new(0),
                removed_all: AtomicUsize::new(0),
            }
        }

        fn trigger_close(&self) {
            let hooks = std::mem::take(&mut *self.close_hooks.lock());
            for hook in hooks {
                hook();
            }
        }
    }

    #[async_trait]
    impl MediaTrack for FakeMediaTrack {
        fn sid(&self) -> String {
            self.info.lock().sid.clone()
        }

        fn kind(&self) -> TrackType {
            self.info.lock().kind
        }

        fn signal_cid(&self) -> String {
            self.signal_cid.clone()
        }

        fn sdp_cid(&self) -> String {
            self.sdp_cid.clone()
        }

        fn is_muted(&self) -> bool {
            self.muted.load(Ordering::SeqCst)
        }

        fn set_muted(&self, muted: bool) {
            self.muted.store(muted, Ordering::SeqCst);
        }

        fn to_proto(&self) -> TrackInfo {
            let mut info = self.info.lock().clone();
            info.muted = self.is_muted();
            info
        }

        fn audio_level(&self) -> Option<(u8, bool)> {
            self.audio
        }

        fn publish_loss_percentage(&self) -> u32 {
            self.loss
        }

        fn num_up_tracks(&self) -> (u32, u32) {
            self.up_tracks
        }

        fn on_close(&self, hook: OnTrackClose) {
            self.close_hooks.lock().push(hook);
        }

        async fn add_receiver(&self, _receiver: Arc<RTCRtpReceiver>, _track: Arc<TrackRemote>) {}

        async fn start(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        async fn add_subscriber(&self, _subscriber: Arc<Participant>) -> Result<(), anyhow::Error> {
            Ok(())
        }

        async fn remove_subscriber(&self, _participant_sid: &str) {}

        async fn remove_all_subscribers(&self) {
            self.removed_all.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeDownTrack {
        kind: TrackType,
        status: ForwardingStatus,
        loss: u32,
        closed: AtomicBool,
    }

    impl FakeDownTrack {
        fn new(kind: TrackType, status: ForwardingStatus, loss: u32) -> Arc<Self> {
            Arc::new(Self {
                kind,
                status,
                loss,
                closed: AtomicBool::new(false),
            })
        }
    }

    impl DownTrack for FakeDownTrack {
        fn kind(&self) -> TrackType {
            self.kind
        }

        fn create_sender_report(&self) -> Option<SenderReport> {
            None
        }

        fn create_source_description_chunks(&self) -> Option<Vec<SourceDescriptionChunk>> {
            None
        }

        fn forwarding_status(&self) -> ForwardingStatus {
            self.status
        }

        fn loss_percentage(&self) -> u32 {
            self.loss
        }

        fn debug_info(&self) -> serde_json::Value {
            serde_json::json!({})
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct NoopTwcc;

    impl TwccResponder for NoopTwcc {
        fn on_feedback(&self, _f: TwccOnFeedback) {}
    }

    type CreatedTracks = Arc<Mutex<Vec<Arc<FakeMediaTrack>>>>;

    fn test_params(
        sink: Arc<RecordingSink>,
        protocol: u32,
        permission: Option<ParticipantPermission>,
    ) -> (ParticipantParams, CreatedTracks) {
        let created: CreatedTracks = Arc::new(Mutex::new(Vec::new()));
        let created_ref = created.clone();
        let media_factory: MediaTrackFactory = Arc::new(move |params| {
            let track = Arc::new(FakeMediaTrack::from_params(params));
            created_ref.lock().push(track.clone());
            track
        });
        let twcc_factory: TwccResponderFactory = Arc::new(|_ssrc| Arc::new(NoopTwcc));

        (
            ParticipantParams {
                identity: "alice".to_owned(),
                metadata: String::new(),
                sink,
                protocol_version: ProtocolVersion(protocol),
                permission,
                hidden: false,
                rtc: WebRtcConfig::default(),
                pli_throttle: PliThrottleConfig::default(),
                media_factory,
                twcc_factory,
            },
            created,
        )
    }

    async fn test_participant() -> (Arc<Participant>, Arc<RecordingSink>, CreatedTracks) {
        let sink = RecordingSink::new();
        let (params, created) = test_params(sink.clone(), 1, None);
        let participant = Participant::new(params).await.unwrap();
        (participant, sink, created)
    }

    fn video_req(cid: &str) -> AddTrackRequest {
        AddTrackRequest {
            cid: cid.to_owned(),
            kind: TrackType::Video,
            name: "cam".to_owned(),
            width: 1280,
            height: 720,
            muted: false,
            disable_dtx: false,
            source: TrackSource::Camera,
        }
    }

    fn audio_req(cid: &str) -> AddTrackRequest {
        AddTrackRequest {
            cid: cid.to_owned(),
            kind: TrackType::Audio,
            name: "mic".to_owned(),
            width: 0,
            height: 0,
            muted: false,
            disable_dtx: false,
            source: TrackSource::Microphone,
        }
    }

    fn peer_info(sid: &str) -> ParticipantInfo {
        ParticipantInfo {
            sid: sid.to_owned(),
            identity: "peer".to_owned(),
            state: ParticipantState::Active,
            tracks: vec![],
            metadata: String::new(),
            joined_at: 0,
            hidden: false,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_empty_identity() {
        let sink = RecordingSink::new();
        let (mut params, _) = test_params(sink, 1, None);
        params.identity = String::new();

        assert!(matches!(
            Participant::new(params).await,
            Err(ParticipantError::MissingIdentity)
        ));
    }

    #[tokio::test]
    async fn test_new_participant_defaults() {
        let (participant, _, _) = test_participant().await;

        assert!(participant.sid().starts_with("PA_"));
        assert_eq!(participant.state(), ParticipantState::Joining);
        assert!(!participant.is_closed());
        assert!(!participant.subscriber_as_primary());
        assert!(participant.can_publish());
    }

    #[tokio::test]
    async fn test_subscriber_primary_creates_data_channels() {
        let sink = RecordingSink::new();
        let (params, _) = test_params(sink, 4, None);
        let participant = Participant::new(params).await.unwrap();

        assert!(participant.subscriber_as_primary());
        assert!(
            participant
                .data_channels
                .outbound(DataPacketKind::Reliable)
                .is_some()
        );
        assert!(
            participant
                .data_channels
                .outbound(DataPacketKind::Lossy)
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_add_track_confirms_with_server_sid() {
        let (participant, sink, _) = test_participant().await;

        participant.add_track(video_req("c1")).await.unwrap();

        assert_eq!(sink.count_kind("trackPublished"), 1);
        let sid = sink.published_track_sid().unwrap();
        assert!(sid.starts_with("TR_"));
        assert_eq!(participant.lock.read().pending_tracks.len(), 1);
    }

    #[tokio::test]
    async fn test_add_track_rejects_duplicate_cid() {
        let (participant, sink, _) = test_participant().await;

        participant.add_track(video_req("c1")).await.unwrap();
        participant.add_track(video_req("c1")).await.unwrap();

        assert_eq!(sink.count_kind("trackPublished"), 1);
        assert_eq!(participant.lock.read().pending_tracks.len(), 1);
    }

    #[tokio::test]
    async fn test_add_track_requires_publish_permission() {
        let sink = RecordingSink::new();
        let permission = ParticipantPermission {
            can_publish: false,
            ..Default::default()
        };
        let (params, _) = test_params(sink.clone(), 1, Some(permission));
        let participant = Participant::new(params).await.unwrap();

        participant.add_track(video_req("c1")).await.unwrap();

        assert_eq!(sink.count_kind("trackPublished"), 0);
        assert!(participant.lock.read().pending_tracks.is_empty());
    }

    #[tokio::test]
    async fn test_publish_reconciles_exact_cid() {
        let (participant, sink, created) = test_participant().await;
        let published = Arc::new(AtomicUsize::new(0));
        {
            let published = published.clone();
            participant.on_track_published(Arc::new(move |_, _| {
                published.fetch_add(1, Ordering::SeqCst);
            }));
        }

        participant.add_track(video_req("c1")).await.unwrap();
        let sid = sink.published_track_sid().unwrap();

        let (track, is_new) = participant
            .reconcile_media_track("c1".to_owned(), TrackType::Video, 1234, "")
            .unwrap();
        assert!(is_new);
        participant.handle_track_published(track.clone());

        assert_eq!(published.load(Ordering::SeqCst), 1);
        assert_eq!(track.sid(), sid);
        assert_eq!(track.signal_cid(), "c1");
        assert_eq!(track.sdp_cid(), "c1");
        assert!(participant.lock.read().pending_tracks.is_empty());
        assert!(participant.get_published_track(&sid).is_some());
        assert_eq!(created.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cid_drift_falls_back_to_kind() {
        let (participant, sink, _) = test_participant().await;

        participant.add_track(audio_req("c1")).await.unwrap();
        let sid = sink.published_track_sid().unwrap();

        let (track, is_new) = participant
            .reconcile_media_track("differs".to_owned(), TrackType::Audio, 99, "")
            .unwrap();

        assert!(is_new);
        assert_eq!(track.sid(), sid);
        assert_eq!(track.signal_cid(), "c1");
        assert_eq!(track.sdp_cid(), "differs");
        assert!(participant.lock.read().pending_tracks.is_empty());
    }

    #[tokio::test]
    async fn test_simulcast_layer_reuses_published_track() {
        let (participant, _, created) = test_participant().await;
        let published = Arc::new(AtomicUsize::new(0));
        {
            let published = published.clone();
            participant.on_track_published(Arc::new(move |_, _| {
                published.fetch_add(1, Ordering::SeqCst);
            }));
        }

        participant.add_track(video_req("c1")).await.unwrap();

        let (first, first_new) = participant
            .reconcile_media_track("c1".to_owned(), TrackType::Video, 1111, "f")
            .unwrap();
        assert!(first_new);
        participant.handle_track_published(first.clone());

        let (second, second_new) = participant
            .reconcile_media_track("c1".to_owned(), TrackType::Video, 2222, "h")
            .unwrap();

        assert!(!second_new);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.lock().len(), 1);
        assert_eq!(published.load(Ordering::SeqCst), 1);
        assert_eq!(participant.lock.read().published_tracks.len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_media_is_dropped() {
        let (participant, _, created) = test_participant().await;

        assert!(
            participant
                .reconcile_media_track("mystery".to_owned(), TrackType::Video, 1, "")
                .is_none()
        );
        assert!(created.lock().is_empty());
    }

    #[tokio::test]
    async fn test_track_close_hook_retires_track() {
        let (participant, sink, created) = test_participant().await;

        participant.add_track(video_req("c1")).await.unwrap();
        let sid = sink.published_track_sid().unwrap();
        let (track, _) = participant
            .reconcile_media_track("c1".to_owned(), TrackType::Video, 1, "")
            .unwrap();
        participant.handle_track_published(track);

        created.lock()[0].trigger_close();

        assert!(participant.get_published_track(&sid).is_none());
    }

    #[tokio::test]
    async fn test_set_track_muted_fires_once_per_change() {
        let (participant, sink, _) = test_participant().await;
        let updated = Arc::new(AtomicUsize::new(0));
        {
            let updated = updated.clone();
            participant.on_track_updated(Arc::new(move |_, _| {
                updated.fetch_add(1, Ordering::SeqCst);
            }));
        }

        participant.add_track(video_req("c1")).await.unwrap();
        let sid = sink.published_track_sid().unwrap();
        let (track, _) = participant
            .reconcile_media_track("c1".to_owned(), TrackType::Video, 1, "")
            .unwrap();

        participant.set_track_muted(&sid, true, false).await;
        participant.set_track_muted(&sid, true, false).await;
        assert_eq!(updated.load(Ordering::SeqCst), 1);
        assert!(track.is_muted());

        participant.set_track_muted(&sid, false, true).await;
        assert_eq!(updated.load(Ordering::SeqCst), 2);
        assert_eq!(sink.count_kind("mute"), 1);
    }

    #[tokio::test]
    async fn test_set_track_muted_on_pending_track() {
        let (participant, sink, _) = test_participant().await;
        let updated = Arc::new(AtomicUsize::new(0));
        {
            let updated = updated.clone();
            participant.on_track_updated(Arc::new(move |_, _| {
                updated.fetch_add(1, Ordering::SeqCst);
            }));
        }

        participant.add_track(video_req("c1")).await.unwrap();
        let sid = sink.published_track_sid().unwrap();

        participant.set_track_muted(&sid, true, false).await;

        let inner = participant.lock.read();
        assert!(inner.pending_tracks.get("c1").unwrap().muted);
        drop(inner);
        assert_eq!(updated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_participant_update_suppression() {
        let (participant, sink, _) = test_participant().await;

        participant
            .send_participant_update(vec![peer_info("PA_peer")], at(100))
            .await
            .unwrap();
        assert_eq!(sink.count_kind("update"), 1);

        // Older stamp for the same peer is dropped.
        participant
            .send_participant_update(vec![peer_info("PA_peer")], at(90))
            .await
            .unwrap();
        assert_eq!(sink.count_kind("update"), 1);

        participant
            .send_participant_update(vec![peer_info("PA_peer")], at(110))
            .await
            .unwrap();
        assert_eq!(sink.count_kind("update"), 2);

        // Multi-peer batches bypass the cache.
        participant
            .send_participant_update(vec![peer_info("PA_peer"), peer_info("PA_other")], at(50))
            .await
            .unwrap();
        assert_eq!(sink.count_kind("update"), 3);
    }

    #[tokio::test]
    async fn test_no_writes_after_disconnect() {
        let (participant, sink, _) = test_participant().await;

        participant.close().await;
        let baseline = sink.count();

        participant
            .send_room_update(RoomInfo {
                sid: "RM_x".to_owned(),
                name: "room".to_owned(),
                metadata: String::new(),
            })
            .await
            .unwrap();
        participant.send_speakers_changed(vec![]).await.unwrap();

        assert_eq!(sink.count(), baseline);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (participant, sink, created) = test_participant().await;
        let closed = Arc::new(AtomicUsize::new(0));
        {
            let closed = closed.clone();
            participant.on_close(Arc::new(move |_| {
                closed.fetch_add(1, Ordering::SeqCst);
            }));
        }

        participant.add_track(video_req("c1")).await.unwrap();
        let (track, _) = participant
            .reconcile_media_track("c1".to_owned(), TrackType::Video, 1, "")
            .unwrap();
        participant.handle_track_published(track);

        let down_track = FakeDownTrack::new(TrackType::Video, ForwardingStatus::Optimal, 0);
        participant.add_subscribed_track(SubscribedTrack::new(
            "TR_remote".to_owned(),
            "bob".to_owned(),
            down_track.clone(),
        ));

        tokio::join!(participant.close(), participant.close());

        assert_eq!(participant.state(), ParticipantState::Disconnected);
        assert!(participant.is_closed());
        assert_eq!(sink.count_kind("leave"), 1);
        assert_eq!(sink.closed.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(down_track.closed.load(Ordering::SeqCst));
        assert_eq!(created.lock()[0].removed_all.load(Ordering::SeqCst), 1);
        assert!(participant.lock.read().subscribed_tracks.is_empty());
    }

    #[tokio::test]
    async fn test_send_data_packet_requires_active_state() {
        let (participant, _, _) = test_participant().await;

        let packet = DataPacket {
            kind: DataPacketKind::Reliable,
            value: DataPacketValue::User(crate::models::data_packet::UserPacket {
                participant_sid: String::new(),
                payload: b"hi".to_vec(),
                destination_sids: vec![],
            }),
        };

        assert!(matches!(
            participant.send_data_packet(packet.clone()).await,
            Err(ParticipantError::DataChannelUnavailable)
        ));

        // Active but publisher-primary with no inbound channels latched.
        participant.update_state(ParticipantState::Joined);
        participant.update_state(ParticipantState::Active);
        assert!(matches!(
            participant.send_data_packet(packet).await,
            Err(ParticipantError::DataChannelUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_send_data_packet_uses_subscriber_channels_when_primary() {
        let sink = RecordingSink::new();
        let (params, _) = test_params(sink, 4, None);
        let participant = Participant::new(params).await.unwrap();
        participant.update_state(ParticipantState::Joined);
        participant.update_state(ParticipantState::Active);

        let packet = DataPacket {
            kind: DataPacketKind::Lossy,
            value: DataPacketValue::User(crate::models::data_packet::UserPacket {
                participant_sid: String::new(),
                payload: b"hi".to_vec(),
                destination_sids: vec![],
            }),
        };

        // The channel exists even though it is not open yet, so the failure
        // mode must not be DataChannelUnavailable.
        match participant.send_data_packet(packet).await {
            Err(ParticipantError::DataChannelUnavailable) => {
                panic!("channel should have been selected")
            }
            _ => {}
        }
    }

    #[tokio::test]
    async fn test_inbound_data_kind_follows_channel() {
        let (participant, _, _) = test_participant().await;
        let received: Arc<Mutex<Vec<DataPacket>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            participant.on_data_packet(Arc::new(move |_, packet| {
                received.lock().push(packet);
            }));
        }

        let packet = DataPacket {
            kind: DataPacketKind::Reliable,
            value: DataPacketValue::User(crate::models::data_packet::UserPacket {
                participant_sid: "PA_spoofed".to_owned(),
                payload: b"hi".to_vec(),
                destination_sids: vec![],
            }),
        };
        let bytes = serde_json::to_vec(&packet).unwrap();

        participant.handle_data_message(DataPacketKind::Lossy, &bytes);

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, DataPacketKind::Lossy);
        match &received[0].value {
            DataPacketValue::User(user) => {
                assert_eq!(user.participant_sid, participant.sid());
            }
            _ => panic!("expected user payload"),
        }
    }

    #[tokio::test]
    async fn test_inbound_non_user_payload_is_dropped() {
        let (participant, _, _) = test_participant().await;
        let received = Arc::new(AtomicUsize::new(0));
        {
            let received = received.clone();
            participant.on_data_packet(Arc::new(move |_, _| {
                received.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let packet = DataPacket {
            kind: DataPacketKind::Reliable,
            value: DataPacketValue::Speaker(crate::models::data_packet::ActiveSpeakerUpdate {
                speakers: vec![],
            }),
        };
        let bytes = serde_json::to_vec(&packet).unwrap();
        participant.handle_data_message(DataPacketKind::Reliable, &bytes);

        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handle_offer_answers_and_joins() {
        let (participant, sink, _) = test_participant().await;

        let mut media = MediaEngine::default();
        media.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media).build();
        let client = api.new_peer_connection(Default::default()).await.unwrap();
        client
            .add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .unwrap();
        let offer = client.create_offer(None).await.unwrap();

        let answer = participant.handle_offer(offer).await.unwrap();

        assert_eq!(answer.sdp_type, RTCSdpType::Answer);
        assert_eq!(participant.state(), ParticipantState::Joined);
        assert_eq!(sink.count_kind("answer"), 1);

        client.close().await.unwrap();
        participant.close().await;
    }

    #[tokio::test]
    async fn test_handle_answer_rejects_non_answer() {
        let (participant, _, _) = test_participant().await;

        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_owned();
        let offer = RTCSessionDescription::offer(sdp).unwrap();

        assert!(matches!(
            participant.handle_answer(offer).await,
            Err(ParticipantError::UnexpectedOffer)
        ));
    }

    #[tokio::test]
    async fn test_ice_restart_without_remote_description_is_noop() {
        let (participant, sink, _) = test_participant().await;

        participant.ice_restart().await.unwrap();

        assert_eq!(sink.count_kind("offer"), 0);
    }

    #[tokio::test]
    async fn test_subscribed_to_tracks_publisher_identities() {
        let (participant, _, _) = test_participant().await;

        participant.add_subscribed_track(SubscribedTrack::new(
            "TR_a".to_owned(),
            "bob".to_owned(),
            FakeDownTrack::new(TrackType::Video, ForwardingStatus::Optimal, 0),
        ));
        participant.add_subscribed_track(SubscribedTrack::new(
            "TR_b".to_owned(),
            "bob".to_owned(),
            FakeDownTrack::new(TrackType::Audio, ForwardingStatus::Optimal, 0),
        ));
        assert!(participant.is_subscribed_to("bob"));

        participant.remove_subscribed_track("bob", "TR_a");
        assert!(participant.is_subscribed_to("bob"));

        participant.remove_subscribed_track("bob", "TR_b");
        assert!(!participant.is_subscribed_to("bob"));
        assert!(participant.subscribed_identities().is_empty());
    }

    #[tokio::test]
    async fn test_state_change_observer_gets_old_state() {
        let (participant, _, _) = test_participant().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        participant.on_state_change(Arc::new(move |_, old| {
            let _ = tx.send(old);
        }));

        participant.update_state(ParticipantState::Joined);
        let old = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old, ParticipantState::Joining);

        participant.update_state(ParticipantState::Active);
        let old = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old, ParticipantState::Joined);

        // Regressions are no-ops.
        participant.update_state(ParticipantState::Joined);
        assert_eq!(participant.state(), ParticipantState::Active);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_primary_ice_connected_activates() {
        let (participant, _, _) = test_participant().await;

        participant.handle_primary_ice_state(RTCIceConnectionState::Connected);

        assert_eq!(participant.state(), ParticipantState::Active);
    }

    #[tokio::test]
    async fn test_primary_ice_failure_closes_asynchronously() {
        let (participant, sink, _) = test_participant().await;

        participant.handle_primary_ice_state(RTCIceConnectionState::Failed);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(participant.is_closed());
        assert_eq!(participant.state(), ParticipantState::Disconnected);
        assert_eq!(sink.count_kind("leave"), 1);
    }

    #[tokio::test]
    async fn test_start_spawns_workers_once() {
        let (participant, _, _) = test_participant().await;

        participant.start();
        assert!(participant.rtcp_rx.lock().is_none());
        participant.start();

        participant.close().await;
    }

    #[tokio::test]
    async fn test_metadata_round_trip_notifies() {
        let (participant, _, _) = test_participant().await;
        let notified = Arc::new(AtomicUsize::new(0));
        {
            let notified = notified.clone();
            participant.on_metadata_update(Arc::new(move |_| {
                notified.fetch_add(1, Ordering::SeqCst);
            }));
        }

        participant.set_metadata("colour=blue".to_owned());

        assert_eq!(participant.metadata(), "colour=blue");
        assert_eq!(participant.to_proto().metadata, "colour=blue");
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_quality_rating() {
        let (participant, _, _) = test_participant().await;
        assert_eq!(
            participant.get_connection_quality().quality,
            ConnectionQuality::Excellent
        );

        // Heavy publish loss alone pushes the average past the poor line.
        {
            let mut track = FakeMediaTrack::plain("TR_a", TrackType::Video);
            track.loss = 10;
            participant
                .lock
                .write()
                .published_tracks
                .insert("TR_a".to_owned(), Arc::new(track));
        }
        assert_eq!(
            participant.get_connection_quality().quality,
            ConnectionQuality::Poor
        );

        // Low loss but a degraded subscription keeps it at good.
        {
            let mut inner = participant.lock.write();
            inner.published_tracks.clear();
            inner.subscribed_tracks.insert(
                "TR_b".to_owned(),
                SubscribedTrack::new(
                    "TR_b".to_owned(),
                    "bob".to_owned(),
                    FakeDownTrack::new(TrackType::Video, ForwardingStatus::Partial, 0),
                ),
            );
        }
        assert_eq!(
            participant.get_connection_quality().quality,
            ConnectionQuality::Good
        );
    }

    #[tokio::test]
    async fn test_audio_level_takes_loudest_active_track() {
        let (participant, _, _) = test_participant().await;
        assert_eq!(participant.get_audio_level(), (SILENT_AUDIO_LEVEL, false));

        {
            let mut inner = participant.lock.write();
            let mut quiet = FakeMediaTrack::plain("TR_quiet", TrackType::Audio);
            quiet.audio = Some((40, true));
            let mut loud = FakeMediaTrack::plain("TR_loud", TrackType::Audio);
            loud.audio = Some((30, true));
            let mut inactive = FakeMediaTrack::plain("TR_idle", TrackType::Audio);
            inactive.audio = Some((5, false));
            inner
                .published_tracks
                .insert("TR_quiet".to_owned(), Arc::new(quiet));
            inner
                .published_tracks
                .insert("TR_loud".to_owned(), Arc::new(loud));
            inner
                .published_tracks
                .insert("TR_idle".to_owned(), Arc::new(inactive));
        }

        assert_eq!(participant.get_audio_level(), (30, true));
    }

    #[tokio::test]
    async fn test_reconcile_rejected_after_close() {
        let (participant, _, created) = test_participant().await;

        participant.add_track(video_req("c1")).await.unwrap();
        participant.close().await;

        assert!(
            participant
                .reconcile_media_track("c1".to_owned(), TrackType::Video, 1, "")
                .is_none()
        );
        assert!(created.lock().is_empty());
    }
}
