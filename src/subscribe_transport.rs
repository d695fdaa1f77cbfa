use std::sync::Arc;

use derivative::Derivative;
use enclose::enc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use webrtc::{
    api::media_engine::MIME_TYPE_VP8,
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    peer_connection::{
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, signaling_state::RTCSignalingState,
        RTCPeerConnection,
    },
    rtcp::{
        header::{PacketType, FORMAT_PLI},
        payload_feedbacks::{
            full_intra_request::FullIntraRequest, picture_loss_indication::PictureLossIndication,
        },
    },
    rtp_transceiver::{rtp_codec::RTCRtpCodecCapability, rtp_sender::RTCRtpSender},
    track::track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal},
};

use crate::{
    config::{MediaConfig, WebRTCTransportConfig},
    coordinator::{SessionCoordinator, SourceSelector},
    error::{Error, TransportErrorKind},
    track::LocalTrackWriter,
    transport::{close_on_session_end, OnIceCandidateFn, PeerConnection, Transport},
};

/// This handles [`webrtc::peer_connection::RTCPeerConnection`] of one subscriber session.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SubscribeTransport {
    /// Subscriber session id in the [`SessionCoordinator`].
    pub id: String,
    peer_connection: Arc<RTCPeerConnection>,
    coordinator: SessionCoordinator,
    pending_candidates: Arc<Mutex<Vec<RTCIceCandidateInit>>>,
    closed: CancellationToken,
    #[derivative(Debug = "ignore")]
    on_ice_candidate_fn: Arc<Mutex<OnIceCandidateFn>>,
}

impl SubscribeTransport {
    pub async fn new(
        coordinator: SessionCoordinator,
        media_config: MediaConfig,
        transport_config: WebRTCTransportConfig,
    ) -> Result<Self, Error> {
        let id = coordinator.open_subscriber().await?;
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
            closed: CancellationToken::new(),
            on_ice_candidate_fn: Arc::new(Mutex::new(Box::new(|_| {}))),
        };

        close_on_session_end(
            transport.coordinator.clone(),
            transport.id.clone(),
            transport.peer_connection.clone(),
            transport.closed.clone(),
        );
        transport.ice_state_hooks();

        tracing::debug!("SubscribeTransport {} is created", transport.id);

        Ok(transport)
    }

    /// Adds an outbound track fed by `selector`, answers `offer` and returns the sink id with the answer.
    /// A layer that is not published yet gets a VP8 track.
    pub async fn subscribe(
        &self,
        selector: SourceSelector,
        offer: RTCSessionDescription,
    ) -> Result<(String, RTCSessionDescription), Error> {
        if self.peer_connection.signaling_state() != RTCSignalingState::Stable {
            return Err(Error::new_transport(
                format!(
                    "Signaling state is {}",
                    self.peer_connection.signaling_state()
                ),
                TransportErrorKind::SignalingStateInvalidError,
            ));
        }
        self.coordinator.offer_received(&self.id).await?;

        let (capability, track_id, stream_id) =
            match self.coordinator.stream_info(selector.clone()).await? {
                Some(info) => (info.capability, info.track_id, info.stream_id),
                None => (
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        clock_rate: 90000,
                        ..Default::default()
                    },
                    "video".to_string(),
                    "rtp-fanout".to_string(),
                ),
            };
        let track = Arc::new(TrackLocalStaticRTP::new(capability, track_id, stream_id));
        let rtp_sender = self
            .peer_connection
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let sink_id = self
            .coordinator
            .on_subscriber_join(&self.id, selector, Arc::new(LocalTrackWriter::new(track)))
            .await?;

        let coordinator = self.coordinator.clone();
        let closed = self.closed.clone();
        tokio::spawn(enc!((sink_id) async move {
            rtcp_event_loop(sink_id, rtp_sender, coordinator, closed).await;
        }));

        let answer = self.get_answer_for_offer(offer).await?;
        self.coordinator.answer_sent(&self.id).await?;
        Ok((sink_id, answer))
    }

    async fn get_answer_for_offer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription, Error> {
        tracing::debug!("subscriber set remote description");
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

        self.peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                Error::new_transport(
                    "Failed to set local description".to_string(),
                    TransportErrorKind::LocalDescriptionError,
                )
            })
    }

    fn ice_state_hooks(&self) {
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
        let id = self.id.clone();
        peer.on_peer_connection_state_change(Box::new(enc!((coordinator, id) move |state| {
            tracing::info!("SubscribeTransport {} connection state changed: {}", id, state);
            Box::pin(enc!((coordinator, id) async move {
                if matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed) {
                    if let Err(err) = coordinator.on_session_ended(&id).await {
                        tracing::debug!("SubscribeTransport {} session already ended: {}", id, err);
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
            tracing::debug!("SubscribeTransport {} session already ended: {}", self.id, err);
        }
        Ok(())
    }
}

/// Relays keyframe requests of the viewer to the source its sink is bound to.
async fn rtcp_event_loop(
    sink_id: String,
    rtp_sender: Arc<RTCRtpSender>,
    coordinator: SessionCoordinator,
    closed: CancellationToken,
) {
    tracing::debug!("Sink id={} RTCP event loop has started", sink_id);

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                break;
            }
            res = rtp_sender.read_rtcp() => {
                match res {
                    Ok((rtcp_packets, _attr)) => {
                        for rtcp in rtcp_packets.into_iter() {
                            let header = rtcp.header();
                            let keyframe = match header.packet_type {
                                PacketType::PayloadSpecificFeedback if header.count == FORMAT_PLI => {
                                    rtcp.as_any().downcast_ref::<PictureLossIndication>().is_some()
                                }
                                PacketType::PayloadSpecificFeedback => {
                                    rtcp.as_any().downcast_ref::<FullIntraRequest>().is_some()
                                }
                                _ => false,
                            };
                            if keyframe {
                                if let Err(err) = coordinator.request_keyframe(&sink_id).await {
                                    tracing::error!("Sink id={} failed to relay keyframe request: {}", sink_id, err);
                                }
                            }
                        }
                    }
                    Err(webrtc::Error::ErrDataChannelNotOpen) | Err(webrtc::Error::ErrClosedPipe) => {
                        break;
                    }
                    Err(err) => {
                        tracing::error!("Sink id={} failed to read rtcp: {}", sink_id, err);
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!("Sink id={} RTCP event loop finished", sink_id);
}

impl PeerConnection for SubscribeTransport {}

impl Transport for SubscribeTransport {
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

impl Drop for SubscribeTransport {
    fn drop(&mut self) {
        self.closed.cancel();
        tracing::debug!("SubscribeTransport {} is dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ForwarderConfig, test_util::wait_until};

    async fn subscribe_transport(coordinator: &SessionCoordinator) -> SubscribeTransport {
        SubscribeTransport::new(
            coordinator.clone(),
            MediaConfig::default(),
            WebRTCTransportConfig::default(),
        )
        .await
        .unwrap()
    }

    fn host_candidate(port: u16) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("candidate:1 1 udp 2130706431 192.0.2.1 {} typ host", port),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn candidates_wait_for_remote_description() {
        let coordinator = SessionCoordinator::new(ForwarderConfig::default());
        let transport = subscribe_transport(&coordinator).await;

        transport.add_ice_candidate(host_candidate(50000)).await.unwrap();
        transport.add_ice_candidate(host_candidate(50001)).await.unwrap();

        let pending: Vec<String> = transport
            .pending_candidates
            .lock()
            .await
            .iter()
            .map(|c| c.candidate.clone())
            .collect();
        assert_eq!(
            pending,
            vec![host_candidate(50000).candidate, host_candidate(50001).candidate]
        );
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn ended_session_closes_only_its_connection() {
        let coordinator = SessionCoordinator::new(ForwarderConfig::default());
        let ended = subscribe_transport(&coordinator).await;
        let other = subscribe_transport(&coordinator).await;

        coordinator.on_session_ended(&ended.id).await.unwrap();
        wait_until(|| ended.connection_state() == RTCPeerConnectionState::Closed).await;

        assert_ne!(other.connection_state(), RTCPeerConnectionState::Closed);
        assert_eq!(
            coordinator.session_state(&other.id).await.unwrap(),
            crate::session::SessionState::AwaitingOffer
        );
        other.close().await.unwrap();
    }
}
