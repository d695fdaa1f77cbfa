use std::sync::Arc;

use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use webrtc::{
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_receiver::RTCRtpReceiver, rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection, RTCRtpTransceiver,
        RTCRtpTransceiverInit,
    },
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal},
        track_remote::TrackRemote,
    },
};
use webrtc_sdp::{
    attribute_type::{SdpAttribute, SdpAttributeType},
    parse_sdp,
};

use crate::{
    config::{MediaConfig, WebRTCTransportConfig},
    coordinator::SessionCoordinator,
    error::{Error, SourceErrorKind, TransportErrorKind},
    session::PublisherType,
    track::RemoteTrackReader,
    transport::{
        close_on_session_end, OnIceCandidateFn, PeerConnection, PublishedStream, RtcpReceiver,
        RtcpSender, Transport,
    },
};

/// This handles [`webrtc::peer_connection::RTCPeerConnection`] of one publisher session.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PublishTransport {
    /// Publisher session id in the [`SessionCoordinator`].
    pub id: String,
    peer_connection: Arc<RTCPeerConnection>,
    coordinator: SessionCoordinator,
    pending_candidates: Arc<Mutex<Vec<RTCIceCandidateInit>>>,
    published_receiver: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    rtcp_sender_channel: Arc<RtcpSender>,
    closed: CancellationToken,
    #[derivative(Debug = "ignore")]
    on_ice_candidate_fn: Arc<Mutex<OnIceCandidateFn>>,
}

impl PublishTransport {
    pub async fn new(
        coordinator: SessionCoordinator,
        media_config: MediaConfig,
        transport_config: WebRTCTransportConfig,
    ) -> Result<Self, Error> {
        let id = coordinator.open_publisher().await?;
        let (s, r) = mpsc::unbounded_channel();
        let (published_sender, published_receiver) = mpsc::unbounded_channel();

        let peer_connection = Self::generate_peer_connection(media_config, transport_config)
            .await
            .map_err(|err| {
                Error::new_transport(
                    format!("Failed to create peer connection: {}", err),
                    TransportErrorKind::PeerConnectionError,
                )
            })?;

        let transport = Self {
            id,
            peer_connection: Arc::new(peer_connection),
            coordinator,
            pending_candidates: Arc::new(Mutex::new(Vec::new())),
            published_receiver: Arc::new(Mutex::new(published_receiver)),
            rtcp_sender_channel: Arc::new(s),
            closed: CancellationToken::new(),
            on_ice_candidate_fn: Arc::new(Mutex::new(Box::new(|_| {}))),
        };

        transport.rtcp_writer_loop(r);
        close_on_session_end(
            transport.coordinator.clone(),
            transport.id.clone(),
            transport.peer_connection.clone(),
            transport.closed.clone(),
        );
        transport.ice_state_hooks(published_sender);

        tracing::debug!("PublishTransport {} is created", transport.id);

        Ok(transport)
    }

    /// Allows the remote side to send one video track.
    pub async fn recv_video(&self) -> Result<Arc<RTCRtpTransceiver>, Error> {
        let transceiver = self
            .peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Video,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(transceiver)
    }

    /// Sends `track` back on the publisher's own connection.
    pub async fn add_output_track(
        &self,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Result<Arc<RTCRtpSender>, Error> {
        let rtp_sender = self
            .peer_connection
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let closed = self.closed.clone();
        tokio::spawn(enc!((rtp_sender) async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    res = rtp_sender.read_rtcp() => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
        }));

        Ok(rtp_sender)
    }

    /// This sets the offer to the [`webrtc::peer_connection::RTCPeerConnection`] and creates answer sdp for it.
    /// An offer with simulcast media makes this session a simulcast publisher.
    pub async fn get_answer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, Error> {
        if self.peer_connection.signaling_state() != RTCSignalingState::Stable {
            return Err(Error::new_transport(
                format!(
                    "Signaling state is {}",
                    self.peer_connection.signaling_state()
                ),
                TransportErrorKind::SignalingStateInvalidError,
            ));
        }

        if is_simulcast_offer(&offer.sdp)? {
            self.coordinator
                .set_publisher_type(&self.id, PublisherType::Simulcast)
                .await?;
        }
        self.coordinator.offer_received(&self.id).await?;

        tracing::debug!("publisher set remote description");
        self.peer_connection.set_remote_description(offer).await?;
        let pendings = self.pending_candidates.lock().await;
        for candidate in pendings.iter() {
            tracing::debug!("Adding pending ICE candidate: {:#?}", candidate);
            if let Err(err) = self
                .peer_connection
                .add_ice_candidate(candidate.clone())
                .await
            {
                tracing::error!("failed to add_ice_candidate: {}", err);
            }
        }
        drop(pendings);

        let answer = self.peer_connection.create_answer(None).await?;
        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection.set_local_description(answer).await?;
        let _ = gather_complete.recv().await;

        let answer = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::new_transport(
                    "Failed to set local description".to_string(),
                    TransportErrorKind::LocalDescriptionError,
                )
            })?;
        self.coordinator.answer_sent(&self.id).await?;
        Ok(answer)
    }

    /// Waits for the next inbound stream of this publisher and returns its source id.
    pub async fn wait_published(&self) -> Result<String, Error> {
        let receiver = self.published_receiver.clone();
        let source_id = receiver.lock().await.recv().await;
        source_id.ok_or_else(|| {
            Error::new_source(
                format!("PublishTransport {} is closed", self.id),
                SourceErrorKind::StreamEndedError,
            )
        })
    }

    fn rtcp_writer_loop(&self, mut rtcp_receiver: RtcpReceiver) {
        let closed = self.closed.clone();
        let pc = self.peer_connection.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            tracing::info!("PublishTransport {} RTCP writer loop", id);
            loop {
                tokio::select! {
                    _ = closed.cancelled() => {
                        break;
                    }
                    data = rtcp_receiver.recv() => {
                        match data {
                            Some(data) => {
                                if let Err(err) = pc.write_rtcp(&[data]).await {
                                    tracing::error!("Error writing RTCP: {}", err);
                                }
                            }
                            None => break,
                        }
                    }
                };
            }
            tracing::info!("PublishTransport {} RTCP writer loop stopped", id);
        });
    }

    // ICE events
    fn ice_state_hooks(&self, published_sender: mpsc::UnboundedSender<String>) {
        let peer = self.peer_connection.clone();
        let on_ice_candidate = Arc::clone(&self.on_ice_candidate_fn);

        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            Box::pin({
                let func = on_ice_candidate.clone();
                async move {
                    let locked = func.lock().await;
                    if let Some(candidate) = candidate {
                        tracing::info!("on ice candidate: {}", candidate);
                        (locked)(candidate);
                    }
                }
            })
        }));

        let coordinator = self.coordinator.clone();
        let rtcp_sender = self.rtcp_sender_channel.clone();
        let id = self.id.clone();
        peer.on_track(Box::new(enc!( (coordinator, rtcp_sender, published_sender, id)
            move |track: Arc<TrackRemote>,
                  receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                Box::pin(enc!( (coordinator, rtcp_sender, published_sender, id) async move {
                    tracing::info!(
                        "Track published: track_id={}, ssrc={}, rid={}",
                        track.id(),
                        track.ssrc(),
                        track.rid()
                    );
                    tracing::debug!("codec: {:#?}", track.codec());

                    let reader = RemoteTrackReader::new(track, Some(receiver));
                    let stream = PublishedStream {
                        info: reader.stream_info(),
                        reader: Arc::new(reader),
                        feedback: rtcp_sender,
                    };
                    match coordinator.on_publisher_stream_started(&id, stream).await {
                        Ok(source_id) => {
                            let _ = published_sender.send(source_id);
                        }
                        Err(err) => {
                            tracing::error!("PublishTransport {} failed to publish track: {}", id, err);
                        }
                    }
                }))
            }
        )));

        peer.on_ice_gathering_state_change(Box::new(move |state| {
            Box::pin(async move {
                tracing::debug!("ICE gathering state changed: {}", state);
            })
        }));

        let coordinator = self.coordinator.clone();
        let id = self.id.clone();
        peer.on_peer_connection_state_change(Box::new(enc!((coordinator, id) move |state| {
            tracing::info!("PublishTransport {} connection state changed: {}", id, state);
            Box::pin(enc!((coordinator, id) async move {
                if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed) {
                    if let Err(err) = coordinator.on_session_ended(&id).await {
                        tracing::debug!("PublishTransport {} session already ended: {}", id, err);
                    }
                }
            }))
        })));
    }

    /// Set callback function when the [`webrtc::peer_connection::RTCPeerConnection`] receives `on_ice_candidate` events.
    pub async fn on_ice_candidate(&self, f: OnIceCandidateFn) {
        let mut callback = self.on_ice_candidate_fn.lock().await;
        *callback = f;
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.closed.cancel();
        self.peer_connection.close().await?;
        if let Err(err) = self.coordinator.on_session_ended(&self.id).await {
            tracing::debug!("PublishTransport {} session already ended: {}", self.id, err);
        }
        Ok(())
    }
}

/// Whether any media section of `sdp` offers simulcast layers.
pub fn is_simulcast_offer(sdp: &str) -> Result<bool, Error> {
    let session = parse_sdp(sdp, false)?;
    let simulcast = session.media.iter().any(|media| {
        media.get_attribute(SdpAttributeType::Simulcast).is_some()
            || media
                .get_attributes()
                .iter()
                .filter(|attr| matches!(attr, SdpAttribute::Rid(_)))
                .count()
                > 1
    });
    Ok(simulcast)
}

impl PeerConnection for PublishTransport {}

impl Transport for PublishTransport {
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if let Some(_rd) = self.peer_connection.remote_description().await {
            tracing::debug!("Adding ICE candidate for {:#?}", candidate);
            self.peer_connection.add_ice_candidate(candidate).await?;
        } else {
            tracing::debug!("Pending ICE candidate for {:#?}", candidate);
            self.pending_candidates.lock().await.push(candidate);
        }

        Ok(())
    }

    fn connection_state(&self) -> RTCPeerConnectionState {
        self.peer_connection.connection_state()
    }
}

impl Drop for PublishTransport {
    fn drop(&mut self) {
        self.closed.cancel();
        tracing::debug!("PublishTransport {} is dropped", self.id);
    }
}
