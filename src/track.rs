use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use webrtc::{
    rtp,
    rtp_transceiver::rtp_receiver::RTCRtpReceiver,
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocalWriter},
        track_remote::TrackRemote,
    },
};

use crate::{
    error::{Error, SinkErrorKind, SourceErrorKind},
    transport::{PacketReader, PacketWriter, ReceivedPacket, StreamInfo},
};

/// Reads RTP from a track a publisher sends to us.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RemoteTrackReader {
    track: Arc<TrackRemote>,
    #[derivative(Debug = "ignore")]
    _rtp_receiver: Option<Arc<RTCRtpReceiver>>,
}

impl RemoteTrackReader {
    pub fn new(track: Arc<TrackRemote>, rtp_receiver: Option<Arc<RTCRtpReceiver>>) -> Self {
        Self {
            track,
            _rtp_receiver: rtp_receiver,
        }
    }

    pub fn stream_info(&self) -> StreamInfo {
        StreamInfo {
            track_id: self.track.id(),
            stream_id: self.track.stream_id(),
            ssrc: self.track.ssrc(),
            rid: layer_tag(self.track.rid()),
            capability: self.track.codec().capability,
        }
    }
}

fn layer_tag(rid: &str) -> Option<String> {
    if rid.is_empty() {
        None
    } else {
        Some(rid.to_string())
    }
}

#[async_trait]
impl PacketReader for RemoteTrackReader {
    async fn read_packet(&self) -> Result<ReceivedPacket, Error> {
        let (packet, _attributes) = self.track.read_rtp().await.map_err(read_error)?;
        Ok(ReceivedPacket {
            packet,
            rid: layer_tag(self.track.rid()),
        })
    }
}

pub(crate) fn read_error(err: webrtc::Error) -> Error {
    match err {
        webrtc::Error::ErrDataChannelNotOpen
        | webrtc::Error::ErrClosedPipe
        | webrtc::Error::Interceptor(webrtc::interceptor::Error::Srtp(
            webrtc_srtp::Error::Util(webrtc_util::Error::ErrBufferClosed),
        )) => Error::new_source(err.to_string(), SourceErrorKind::StreamEndedError),
        err => Error::new_source(err.to_string(), SourceErrorKind::ReadFailedError),
    }
}

/// Writes RTP to a track we send to a subscriber.
#[derive(Debug)]
pub struct LocalTrackWriter {
    track: Arc<TrackLocalStaticRTP>,
}

impl LocalTrackWriter {
    pub fn new(track: Arc<TrackLocalStaticRTP>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl PacketWriter for LocalTrackWriter {
    async fn write_packet(&self, packet: &rtp::packet::Packet) -> Result<(), Error> {
        self.track.write_rtp(packet).await.map_err(write_error)?;
        Ok(())
    }
}

/// Binding errors are flattened into one message by `webrtc`, so a closed pipe is also
/// recognized by its text.
pub(crate) fn write_error(err: webrtc::Error) -> Error {
    let closed_pipe = webrtc::Error::ErrClosedPipe.to_string();
    match err {
        webrtc::Error::ErrClosedPipe => {
            Error::new_sink(closed_pipe, SinkErrorKind::NoConsumerError)
        }
        err if err.to_string().contains(&closed_pipe) => {
            Error::new_sink(err.to_string(), SinkErrorKind::NoConsumerError)
        }
        err => Error::new_sink(err.to_string(), SinkErrorKind::WriteFailedError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_streams_end_the_source() {
        for err in [
            webrtc::Error::ErrClosedPipe,
            webrtc::Error::ErrDataChannelNotOpen,
            webrtc::Error::Interceptor(webrtc::interceptor::Error::Srtp(
                webrtc_srtp::Error::Util(webrtc_util::Error::ErrBufferClosed),
            )),
        ] {
            assert_eq!(
                read_error(err).source_kind(),
                Some(&SourceErrorKind::StreamEndedError)
            );
        }
        assert_eq!(
            read_error(webrtc::Error::ErrConnectionClosed).source_kind(),
            Some(&SourceErrorKind::ReadFailedError)
        );
    }

    #[test]
    fn closed_pipe_means_no_consumer() {
        assert!(write_error(webrtc::Error::ErrClosedPipe).is_no_consumer());

        let flattened = webrtc::Error::new(format!(
            "{}\n{}",
            webrtc::Error::ErrClosedPipe,
            webrtc::Error::ErrClosedPipe
        ));
        assert!(write_error(flattened).is_no_consumer());

        let err = write_error(webrtc::Error::ErrUnsupportedCodec);
        assert!(!err.is_no_consumer());
        assert!(matches!(
            err,
            Error::SinkError(ref e) if e.kind == SinkErrorKind::WriteFailedError
        ));
    }

    #[test]
    fn empty_rid_is_untagged() {
        assert_eq!(layer_tag(""), None);
        assert_eq!(layer_tag("h"), Some("h".to_string()));
    }
}
