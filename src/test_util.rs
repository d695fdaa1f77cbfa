use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify};
use webrtc::{
    rtcp::{
        payload_feedbacks::{
            picture_loss_indication::PictureLossIndication,
            receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate,
        },
    },
    rtp::{self, header::Header},
};

use crate::{
    error::{Error, SinkErrorKind, SourceErrorKind},
    transport::{
        FeedbackSender, PacketReader, PacketWriter, PublishedStream, ReceivedPacket, RtcpPacket,
        StreamInfo,
    },
};

pub(crate) fn packet(sequence_number: u16) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: Header {
            version: 2,
            sequence_number,
            timestamp: sequence_number as u32 * 3000,
            ssrc: 1000,
            ..Default::default()
        },
        payload: Bytes::from(sequence_number.to_be_bytes().to_vec()),
    }
}

/// Reader fed from a channel. Closing the sender ends the stream.
pub(crate) struct ChannelReader {
    receiver: Mutex<mpsc::UnboundedReceiver<ReceivedPacket>>,
}

#[async_trait]
impl PacketReader for ChannelReader {
    async fn read_packet(&self) -> Result<ReceivedPacket, Error> {
        match self.receiver.lock().await.recv().await {
            Some(packet) => Ok(packet),
            None => Err(Error::new_source(
                "channel closed".to_string(),
                SourceErrorKind::StreamEndedError,
            )),
        }
    }
}

pub(crate) fn channel_reader() -> (mpsc::UnboundedSender<ReceivedPacket>, Arc<ChannelReader>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        tx,
        Arc::new(ChannelReader {
            receiver: Mutex::new(rx),
        }),
    )
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum WriteMode {
    Accept,
    NoConsumer,
    Fail,
}

/// Writer that records every packet it accepts.
pub(crate) struct RecordingWriter {
    packets: StdMutex<Vec<rtp::packet::Packet>>,
    mode: StdMutex<WriteMode>,
    gate: StdMutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl RecordingWriter {
    pub(crate) fn new(mode: WriteMode) -> Arc<Self> {
        Arc::new(Self {
            packets: StdMutex::new(vec![]),
            mode: StdMutex::new(mode),
            gate: StdMutex::new(None),
        })
    }

    /// The next write signals `entered` and then blocks until `release` is notified.
    pub(crate) fn block_next_write(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        (entered, release)
    }

    pub(crate) fn set_mode(&self, mode: WriteMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub(crate) fn packets(&self) -> Vec<rtp::packet::Packet> {
        self.packets.lock().unwrap().clone()
    }

    pub(crate) fn sequence_numbers(&self) -> Vec<u16> {
        self.packets()
            .iter()
            .map(|p| p.header.sequence_number)
            .collect()
    }

    pub(crate) fn payload_ids(&self) -> Vec<u16> {
        self.packets()
            .iter()
            .map(|p| u16::from_be_bytes([p.payload[0], p.payload[1]]))
            .collect()
    }
}

#[async_trait]
impl PacketWriter for RecordingWriter {
    async fn write_packet(&self, packet: &rtp::packet::Packet) -> Result<(), Error> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        let mode = *self.mode.lock().unwrap();
        match mode {
            WriteMode::Accept => {
                self.packets.lock().unwrap().push(packet.clone());
                Ok(())
            }
            WriteMode::NoConsumer => Err(Error::new_sink(
                "io: read/write on closed pipe".to_string(),
                SinkErrorKind::NoConsumerError,
            )),
            WriteMode::Fail => Err(Error::new_sink(
                "transport is broken".to_string(),
                SinkErrorKind::WriteFailedError,
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum SentFeedback {
    Pli { media_ssrc: u32 },
    Remb { sender_ssrc: u32, bitrate: f32 },
    Other,
}

#[derive(Default)]
pub(crate) struct RecordingFeedback {
    sent: StdMutex<Vec<SentFeedback>>,
}

impl RecordingFeedback {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn sent(&self) -> Vec<SentFeedback> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn pli_count(&self) -> usize {
        self.sent()
            .iter()
            .filter(|f| matches!(f, SentFeedback::Pli { .. }))
            .count()
    }

    pub(crate) fn remb_count(&self) -> usize {
        self.sent()
            .iter()
            .filter(|f| matches!(f, SentFeedback::Remb { .. }))
            .count()
    }
}

impl FeedbackSender for RecordingFeedback {
    fn send_feedback(&self, packet: RtcpPacket) -> Result<(), Error> {
        let any = packet.as_any();
        let sent = if let Some(pli) = any.downcast_ref::<PictureLossIndication>() {
            SentFeedback::Pli {
                media_ssrc: pli.media_ssrc,
            }
        } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
            SentFeedback::Remb {
                sender_ssrc: remb.sender_ssrc,
                bitrate: remb.bitrate,
            }
        } else {
            SentFeedback::Other
        };
        self.sent.lock().unwrap().push(sent);
        Ok(())
    }
}

pub(crate) struct TestStream {
    pub(crate) packets: mpsc::UnboundedSender<ReceivedPacket>,
    pub(crate) feedback: Arc<RecordingFeedback>,
    pub(crate) stream: PublishedStream,
}

impl TestStream {
    pub(crate) fn new(ssrc: u32, rid: Option<&str>) -> Self {
        let (packets, reader) = channel_reader();
        let feedback = RecordingFeedback::new();
        let stream = PublishedStream {
            info: StreamInfo {
                track_id: format!("track-{}", ssrc),
                stream_id: "stream".to_string(),
                ssrc,
                rid: rid.map(|r| r.to_string()),
                ..Default::default()
            },
            reader,
            feedback: feedback.clone(),
        };
        Self {
            packets,
            feedback,
            stream,
        }
    }

    pub(crate) fn push(&self, sequence_number: u16) {
        let rid = self.stream.info.rid.clone();
        self.push_tagged(sequence_number, rid);
    }

    pub(crate) fn push_tagged(&self, sequence_number: u16, rid: Option<String>) {
        let _ = self.packets.send(ReceivedPacket {
            packet: packet(sequence_number),
            rid,
        });
    }
}

/// Lets spawned tasks drain their queues.
pub(crate) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Polls `condition` until it holds, failing the test after about a second.
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    panic!("condition was not met in time");
}
