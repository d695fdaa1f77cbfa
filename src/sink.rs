use std::sync::{Arc, Mutex};

use derivative::Derivative;
use uuid::Uuid;
use webrtc::rtp;

use crate::{error::Error, transport::PacketWriter};

/// Outbound track of one subscriber session.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PacketSink {
    pub id: String,
    /// Subscriber session this sink belongs to.
    pub session_id: String,
    #[derivative(Debug = "ignore")]
    writer: Arc<dyn PacketWriter>,
    sequence: Mutex<Option<SequenceState>>,
}

#[derive(Debug, Clone)]
struct SequenceState {
    source_id: String,
    sequence_offset: u16,
    timestamp_offset: u32,
    last_sequence: u16,
    last_timestamp: u32,
}

impl PacketSink {
    pub fn new(session_id: String, writer: Arc<dyn PacketWriter>) -> Self {
        let id = Uuid::new_v4().to_string();
        tracing::debug!("PacketSink id={} is created for session={}", id, session_id);
        Self {
            id,
            session_id,
            writer,
            sequence: Mutex::new(None),
        }
    }

    /// Writes a packet read from `source_id`. After a change of source, sequence numbers and
    /// timestamps continue from the last packet written.
    pub async fn write(&self, source_id: &str, packet: &rtp::packet::Packet) -> Result<(), Error> {
        let rewritten = self.rewrite(source_id, packet);
        match rewritten {
            Some(packet) => self.writer.write_packet(&packet).await,
            None => self.writer.write_packet(packet).await,
        }
    }

    fn rewrite(&self, source_id: &str, packet: &rtp::packet::Packet) -> Option<rtp::packet::Packet> {
        let mut guard = match self.sequence.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let header = &packet.header;

        let state = guard.get_or_insert_with(|| SequenceState {
            source_id: source_id.to_string(),
            sequence_offset: 0,
            timestamp_offset: 0,
            last_sequence: header.sequence_number,
            last_timestamp: header.timestamp,
        });

        if state.source_id != source_id {
            tracing::debug!(
                "PacketSink id={} switched from source={} to source={}",
                self.id,
                state.source_id,
                source_id
            );
            state.source_id = source_id.to_string();
            state.sequence_offset = state
                .last_sequence
                .wrapping_add(1)
                .wrapping_sub(header.sequence_number);
            state.timestamp_offset = state
                .last_timestamp
                .wrapping_add(1)
                .wrapping_sub(header.timestamp);
        }

        let sequence_number = header.sequence_number.wrapping_add(state.sequence_offset);
        let timestamp = header.timestamp.wrapping_add(state.timestamp_offset);
        state.last_sequence = sequence_number;
        state.last_timestamp = timestamp;

        if state.sequence_offset == 0 && state.timestamp_offset == 0 {
            return None;
        }

        let mut packet = packet.clone();
        packet.header.sequence_number = sequence_number;
        packet.header.timestamp = timestamp;
        Some(packet)
    }
}

impl Drop for PacketSink {
    fn drop(&mut self) {
        tracing::debug!("PacketSink id={} is dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{packet, RecordingWriter, WriteMode};

    #[tokio::test]
    async fn passes_packets_through_from_one_source() {
        let writer = RecordingWriter::new(WriteMode::Accept);
        let sink = PacketSink::new("session".to_string(), writer.clone());

        for seq in [10, 11, 12] {
            sink.write("a", &packet(seq)).await.unwrap();
        }

        assert_eq!(writer.sequence_numbers(), vec![10, 11, 12]);
        let timestamps: Vec<u32> = writer.packets().iter().map(|p| p.header.timestamp).collect();
        assert_eq!(timestamps, vec![30000, 33000, 36000]);
    }

    #[tokio::test]
    async fn continues_sequence_after_source_switch() {
        let writer = RecordingWriter::new(WriteMode::Accept);
        let sink = PacketSink::new("session".to_string(), writer.clone());

        sink.write("q", &packet(100)).await.unwrap();
        sink.write("q", &packet(101)).await.unwrap();
        sink.write("h", &packet(7)).await.unwrap();
        sink.write("h", &packet(8)).await.unwrap();
        sink.write("f", &packet(u16::MAX)).await.unwrap();
        sink.write("f", &packet(0)).await.unwrap();

        assert_eq!(
            writer.sequence_numbers(),
            vec![100, 101, 102, 103, 104, 105]
        );
        let timestamps: Vec<u32> = writer.packets().iter().map(|p| p.header.timestamp).collect();
        assert_eq!(timestamps[2], timestamps[1] + 1);
        assert_eq!(timestamps[3], timestamps[2] + 3000);
        assert_eq!(writer.payload_ids(), vec![100, 101, 7, 8, u16::MAX, 0]);
    }

    #[tokio::test]
    async fn surfaces_writer_errors() {
        let writer = RecordingWriter::new(WriteMode::NoConsumer);
        let sink = PacketSink::new("session".to_string(), writer.clone());

        let err = sink.write("a", &packet(1)).await.unwrap_err();
        assert!(err.is_no_consumer());

        writer.set_mode(WriteMode::Fail);
        let err = sink.write("a", &packet(2)).await.unwrap_err();
        assert!(!err.is_no_consumer());
    }
}
