use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder,
    },
    ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
    interceptor::registry::Registry,
    peer_connection::{peer_connection_state::RTCPeerConnectionState, RTCPeerConnection},
    rtcp, rtp,
    rtp_transceiver::rtp_codec::{
        RTCRtpCodecCapability, RTCRtpHeaderExtensionCapability, RTPCodecType,
    },
};

use crate::{
    config::{MediaConfig, WebRTCTransportConfig},
    coordinator::SessionCoordinator,
    error::{Error, TransportErrorKind},
};

pub type RtcpPacket = Box<dyn rtcp::packet::Packet + Send + Sync>;
pub type RtcpSender = mpsc::UnboundedSender<RtcpPacket>;
pub type RtcpReceiver = mpsc::UnboundedReceiver<RtcpPacket>;

pub type OnIceCandidateFn = Box<dyn Fn(RTCIceCandidate) + Send + Sync>;

/// Metadata of an inbound stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamInfo {
    pub track_id: String,
    pub stream_id: String,
    pub ssrc: u32,
    /// RTP stream id of a simulcast layer.
    pub rid: Option<String>,
    pub capability: RTCRtpCodecCapability,
}

/// One packet read from an inbound stream together with the layer tag it arrived on.
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub packet: rtp::packet::Packet,
    pub rid: Option<String>,
}

/// Inbound side of a publisher's track.
#[async_trait]
pub trait PacketReader: Send + Sync {
    /// Waits for the next packet. Any error ends the stream.
    async fn read_packet(&self) -> Result<ReceivedPacket, Error>;
}

/// Outbound track bound to one subscriber.
#[async_trait]
pub trait PacketWriter: Send + Sync {
    /// Fails with [`crate::error::SinkErrorKind::NoConsumerError`] while nobody consumes the track.
    async fn write_packet(&self, packet: &rtp::packet::Packet) -> Result<(), Error>;
}

/// Upstream RTCP channel of the connection a stream came from.
pub trait FeedbackSender: Send + Sync {
    fn send_feedback(&self, packet: RtcpPacket) -> Result<(), Error>;
}

impl FeedbackSender for RtcpSender {
    fn send_feedback(&self, packet: RtcpPacket) -> Result<(), Error> {
        self.send(packet).map_err(|_| {
            Error::new_transport(
                "RTCP writer loop is stopped".to_string(),
                TransportErrorKind::FeedbackChannelClosedError,
            )
        })
    }
}

/// Everything the coordinator needs from a publisher's inbound stream.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct PublishedStream {
    pub info: StreamInfo,
    #[derivative(Debug = "ignore")]
    pub reader: Arc<dyn PacketReader>,
    #[derivative(Debug = "ignore")]
    pub feedback: Arc<dyn FeedbackSender>,
}

pub(crate) trait PeerConnection {
    async fn generate_peer_connection(
        media_config: MediaConfig,
        transport_config: WebRTCTransportConfig,
    ) -> Result<RTCPeerConnection, Error> {
        let mut me = MediaEngine::default();
        if media_config.codec.is_empty() {
            me.register_default_codecs()?;
        } else {
            for codec in media_config.codec.audio {
                me.register_codec(codec, RTPCodecType::Audio)?;
            }
            for codec in media_config.codec.video {
                me.register_codec(codec, RTPCodecType::Video)?;
            }
        }

        for uri in media_config.header_extension.audio {
            me.register_header_extension(
                RTCRtpHeaderExtensionCapability { uri },
                RTPCodecType::Audio,
                None,
            )?;
        }
        for uri in media_config.header_extension.video {
            me.register_header_extension(
                RTCRtpHeaderExtensionCapability { uri },
                RTPCodecType::Video,
                None,
            )?;
        }

        let registry = register_default_interceptors(Registry::new(), &mut me)?;

        let api = APIBuilder::new()
            .with_media_engine(me)
            .with_interceptor_registry(registry)
            .with_setting_engine(transport_config.setting_engine())
            .build();

        let peer_connection = api
            .new_peer_connection(transport_config.configuration())
            .await?;
        Ok(peer_connection)
    }
}

/// Closes `peer_connection` once the coordinator closes `session_id`. Stops when `closed` fires.
pub(crate) fn close_on_session_end(
    coordinator: SessionCoordinator,
    session_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    closed: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = closed.cancelled() => {}
            _ = coordinator.session_closed(&session_id) => {
                tracing::info!("Session id={} is closed, closing its peer connection", session_id);
                closed.cancel();
                if let Err(err) = peer_connection.close().await {
                    tracing::error!("Session id={} failed to close peer connection: {}", session_id, err);
                }
            }
        }
    });
}

pub trait Transport {
    /// Adds the candidate, or keeps it until the remote description is set.
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error>;
    fn connection_state(&self) -> RTCPeerConnectionState;
}
