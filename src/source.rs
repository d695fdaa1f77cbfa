use std::sync::Arc;

use derivative::Derivative;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

use crate::{
    config::Rid,
    coordinator::CoordinatorEvent,
    error::Error,
    forwarding_table::ForwardingTable,
    transport::{FeedbackSender, PacketReader, PublishedStream, ReceivedPacket, StreamInfo},
};

/// One inbound media stream of a publisher session.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PacketSource {
    pub id: String,
    pub session_id: String,
    pub info: StreamInfo,
    /// Parsed layer tag, `None` for untagged streams.
    pub rid: Option<Rid>,
    #[derivative(Debug = "ignore")]
    reader: Arc<dyn PacketReader>,
    #[derivative(Debug = "ignore")]
    feedback: Arc<dyn FeedbackSender>,
}

impl PacketSource {
    pub fn new(session_id: String, stream: PublishedStream) -> Self {
        let id = Uuid::new_v4().to_string();
        let rid = stream.info.rid.as_deref().and_then(Rid::from_tag);
        tracing::debug!(
            "PacketSource id={} ssrc={} rid={:?} is created for session={}",
            id,
            stream.info.ssrc,
            stream.info.rid,
            session_id
        );
        Self {
            id,
            session_id,
            info: stream.info,
            rid,
            reader: stream.reader,
            feedback: stream.feedback,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.info.ssrc
    }

    pub(crate) fn feedback_sender(&self) -> Arc<dyn FeedbackSender> {
        self.feedback.clone()
    }

    /// Asks the publisher for a new keyframe on this stream.
    pub fn request_keyframe(&self) -> Result<(), Error> {
        tracing::debug!("PacketSource id={} ssrc={} sends PLI", self.id, self.ssrc());
        self.feedback.send_feedback(Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: self.ssrc(),
        }))
    }

    fn accepts(&self, received: &ReceivedPacket) -> bool {
        match received.rid.as_deref() {
            None => true,
            Some(tag) => self.info.rid.as_deref() == Some(tag),
        }
    }

    pub(crate) fn spawn_read_loop(
        self: &Arc<Self>,
        table: Arc<ForwardingTable>,
        event_sender: mpsc::UnboundedSender<CoordinatorEvent>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let source = Arc::clone(self);
        tokio::spawn(async move {
            let error = source.read_loop(table, &event_sender, token).await;
            let _ = event_sender.send(CoordinatorEvent::SourceEnded {
                source_id: source.id.clone(),
                error,
            });
        })
    }

    async fn read_loop(
        &self,
        table: Arc<ForwardingTable>,
        event_sender: &mpsc::UnboundedSender<CoordinatorEvent>,
        token: CancellationToken,
    ) -> Option<Error> {
        tracing::debug!(
            "PacketSource id={} ssrc={} read loop has started, mime_type={}",
            self.id,
            self.ssrc(),
            self.info.capability.mime_type
        );

        let error = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    break None;
                }
                res = self.reader.read_packet() => {
                    match res {
                        Ok(received) => {
                            if !self.accepts(&received) {
                                tracing::trace!(
                                    "PacketSource id={} ssrc={} dropped packet tagged rid={:?}",
                                    self.id,
                                    self.ssrc(),
                                    received.rid
                                );
                                continue;
                            }
                            tracing::trace!(
                                "PacketSource id={} ssrc={} received RTP ssrc={} seq={} timestamp={}",
                                self.id,
                                self.ssrc(),
                                received.packet.header.ssrc,
                                received.packet.header.sequence_number,
                                received.packet.header.timestamp
                            );

                            let report = table.forward(&self.id, &received.packet).await;
                            for (sink, error) in report.failed {
                                let _ = event_sender.send(CoordinatorEvent::SinkFailed {
                                    sink_id: sink.id.clone(),
                                    error,
                                });
                            }
                        }
                        Err(err) => {
                            token.cancel();
                            tracing::debug!(
                                "PacketSource id={} ssrc={} stream ended: {}",
                                self.id,
                                self.ssrc(),
                                err
                            );
                            break Some(err);
                        }
                    }
                }
            }
        };

        tracing::debug!(
            "PacketSource id={} ssrc={} read loop has finished",
            self.id,
            self.ssrc()
        );
        error
    }
}

impl Drop for PacketSource {
    fn drop(&mut self) {
        tracing::debug!("PacketSource id={} ssrc={} is dropped", self.id, self.ssrc());
    }
}
