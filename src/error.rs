use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    WebRTCError(#[from] webrtc::Error),
    #[error(transparent)]
    SdpError(#[from] webrtc_sdp::error::SdpParserError),
    #[error(transparent)]
    Base64Error(#[from] base64::DecodeError),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    SinkError(#[from] SinkError),
    #[error(transparent)]
    SourceError(#[from] SourceError),
    #[error(transparent)]
    SessionError(#[from] SessionError),
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SinkError {
    pub kind: SinkErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
}

#[derive(thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum TransportErrorKind {
    #[error("peer connection error")]
    PeerConnectionError,
    #[error("local description error")]
    LocalDescriptionError,
    #[error("signaling state invalid error")]
    SignalingStateInvalidError,
    #[error("feedback channel closed error")]
    FeedbackChannelClosedError,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum SinkErrorKind {
    /// The outbound track has no connected consumer yet, or it is gone. Forwarding goes on.
    #[error("no consumer error")]
    NoConsumerError,
    #[error("write failed error")]
    WriteFailedError,
    #[error("sink not found error")]
    SinkNotFoundError,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum SourceErrorKind {
    #[error("stream ended error")]
    StreamEndedError,
    #[error("read failed error")]
    ReadFailedError,
    #[error("source not found error")]
    SourceNotFoundError,
    #[error("layer not found error")]
    LayerNotFoundError,
    #[error("layer already published error")]
    LayerAlreadyPublishedError,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum SessionErrorKind {
    #[error("session not found error")]
    SessionNotFoundError,
    #[error("invalid state transition error")]
    InvalidStateTransitionError,
    #[error("role mismatch error")]
    RoleMismatchError,
    #[error("coordinator closed error")]
    CoordinatorClosedError,
}

impl Error {
    pub fn new_transport(message: String, kind: TransportErrorKind) -> Error {
        Error::TransportError(TransportError { kind, message })
    }

    pub fn new_sink(message: String, kind: SinkErrorKind) -> Error {
        Error::SinkError(SinkError { kind, message })
    }

    pub fn new_source(message: String, kind: SourceErrorKind) -> Error {
        Error::SourceError(SourceError { kind, message })
    }

    pub fn new_session(message: String, kind: SessionErrorKind) -> Error {
        Error::SessionError(SessionError { kind, message })
    }

    /// Whether this is the recoverable "nobody is listening on this track" write failure.
    pub fn is_no_consumer(&self) -> bool {
        matches!(
            self,
            Error::SinkError(SinkError {
                kind: SinkErrorKind::NoConsumerError,
                ..
            })
        )
    }

    pub fn source_kind(&self) -> Option<&SourceErrorKind> {
        match self {
            Error::SourceError(err) => Some(&err.kind),
            _ => None,
        }
    }

    pub fn session_kind(&self) -> Option<&SessionErrorKind> {
        match self {
            Error::SessionError(err) => Some(&err.kind),
            _ => None,
        }
    }

    pub(crate) fn coordinator_closed() -> Error {
        Error::new_session(
            "Coordinator event loop is not running".to_string(),
            SessionErrorKind::CoordinatorClosedError,
        )
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("rtp_fanout::TransportError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("rtp_fanout::SinkError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("rtp_fanout::SourceError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}

impl fmt::Debug for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("rtp_fanout::SessionError");

        builder.field("kind", &self.kind);
        builder.field("message", &self.message);

        builder.finish()
    }
}
