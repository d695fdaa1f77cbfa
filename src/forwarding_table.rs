use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, RwLock};
use webrtc::rtp;

use crate::{
    error::{Error, SourceErrorKind},
    sink::PacketSink,
};

/// Maps every live source to the sinks its packets are delivered to.
///
/// Each source has its own sink set behind a `RwLock`. A fan-out holds the read guard of its
/// source for the whole iteration, attach and detach take the write guard of the sources they
/// touch. So every fan-out sees one consistent set of sinks, a sink detached while a packet is
/// being delivered receives that packet at most once and nothing afterwards, and a stalled sink
/// only holds up its own source.
///
/// Mutations are serialized on `bound_to`. Lock order is `bound_to`, then `sources`, then a sink
/// set; `sources` is never held across another await.
#[derive(Debug, Default)]
pub struct ForwardingTable {
    sources: RwLock<HashMap<String, Arc<SinkSet>>>,
    bound_to: Mutex<HashMap<String, String>>,
}

type SinkSet = RwLock<HashMap<String, Arc<PacketSink>>>;

/// Result of delivering one packet to every sink of a source.
#[derive(Debug, Default)]
pub struct ForwardReport {
    pub delivered: usize,
    pub no_consumer: usize,
    /// Sinks that failed fatally. They are already detached.
    pub failed: Vec<(Arc<PacketSink>, Error)>,
}

impl ForwardingTable {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sink_set(&self, source_id: &str) -> Option<Arc<SinkSet>> {
        self.sources.read().await.get(source_id).cloned()
    }

    pub async fn add_source(&self, source_id: &str) {
        let mut sources = self.sources.write().await;
        sources.entry(source_id.to_string()).or_default();
    }

    /// Removes the source and returns the sinks that were bound to it.
    pub async fn remove_source(&self, source_id: &str) -> Vec<Arc<PacketSink>> {
        let mut bound_to = self.bound_to.lock().await;
        let removed = self.sources.write().await.remove(source_id);
        let Some(sinks) = removed else {
            return vec![];
        };
        let sinks: Vec<Arc<PacketSink>> = sinks.write().await.drain().map(|(_, sink)| sink).collect();
        for sink in sinks.iter() {
            bound_to.remove(&sink.id);
        }
        sinks
    }

    pub async fn contains_source(&self, source_id: &str) -> bool {
        self.sources.read().await.contains_key(source_id)
    }

    /// Binds `sink` to `source_id`. A sink bound to another source is moved, and the id of that
    /// previous source is returned.
    pub async fn attach(
        &self,
        sink: Arc<PacketSink>,
        source_id: &str,
    ) -> Result<Option<String>, Error> {
        let mut bound_to = self.bound_to.lock().await;
        let Some(target) = self.sink_set(source_id).await else {
            return Err(Error::new_source(
                format!("Source {} is not found", source_id),
                SourceErrorKind::SourceNotFoundError,
            ));
        };

        let previous = bound_to.remove(&sink.id);
        if let Some(previous) = previous.as_ref() {
            if let Some(sinks) = self.sink_set(previous).await {
                sinks.write().await.remove(&sink.id);
            }
        }

        tracing::debug!("PacketSink id={} attached to source={}", sink.id, source_id);
        bound_to.insert(sink.id.clone(), source_id.to_string());
        target.write().await.insert(sink.id.clone(), sink);

        Ok(previous.filter(|previous| previous != source_id))
    }

    pub async fn detach(&self, sink_id: &str) -> Option<Arc<PacketSink>> {
        let mut bound_to = self.bound_to.lock().await;
        self.unbind(&mut bound_to, sink_id).await
    }

    async fn unbind(
        &self,
        bound_to: &mut HashMap<String, String>,
        sink_id: &str,
    ) -> Option<Arc<PacketSink>> {
        let source_id = bound_to.remove(sink_id)?;
        let sinks = self.sink_set(&source_id).await?;
        let sink = sinks.write().await.remove(sink_id);
        tracing::debug!("PacketSink id={} detached from source={}", sink_id, source_id);
        sink
    }

    pub async fn source_of(&self, sink_id: &str) -> Option<String> {
        self.bound_to.lock().await.get(sink_id).cloned()
    }

    pub async fn sink_ids(&self, source_id: &str) -> Vec<String> {
        match self.sink_set(source_id).await {
            Some(sinks) => sinks.read().await.keys().cloned().collect(),
            None => vec![],
        }
    }

    /// Delivers `packet` to every sink currently bound to `source_id`.
    pub async fn forward(&self, source_id: &str, packet: &rtp::packet::Packet) -> ForwardReport {
        let mut report = ForwardReport::default();
        let Some(sinks) = self.sink_set(source_id).await else {
            return report;
        };
        {
            let sinks = sinks.read().await;
            for sink in sinks.values() {
                match sink.write(source_id, packet).await {
                    Ok(()) => report.delivered += 1,
                    Err(err) if err.is_no_consumer() => {
                        tracing::trace!(
                            "PacketSink id={} has no consumer yet, seq={}",
                            sink.id,
                            packet.header.sequence_number
                        );
                        report.no_consumer += 1;
                    }
                    Err(err) => {
                        tracing::error!("PacketSink id={} failed to write rtp: {}", sink.id, err);
                        report.failed.push((sink.clone(), err));
                    }
                }
            }
        }

        if !report.failed.is_empty() {
            let mut bound_to = self.bound_to.lock().await;
            for (sink, _) in report.failed.iter() {
                if bound_to.get(&sink.id).map(String::as_str) == Some(source_id) {
                    self.unbind(&mut bound_to, &sink.id).await;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_util::{packet, RecordingWriter, WriteMode};

    fn sink(mode: WriteMode) -> (Arc<PacketSink>, Arc<RecordingWriter>) {
        let writer = RecordingWriter::new(mode);
        let sink = Arc::new(PacketSink::new("session".to_string(), writer.clone()));
        (sink, writer)
    }

    #[tokio::test]
    async fn late_attach_receives_only_later_packets() {
        let table = ForwardingTable::new();
        table.add_source("s").await;
        let (a, a_writer) = sink(WriteMode::Accept);
        let (b, b_writer) = sink(WriteMode::Accept);

        table.attach(a, "s").await.unwrap();
        table.forward("s", &packet(1)).await;
        table.attach(b, "s").await.unwrap();
        table.forward("s", &packet(2)).await;
        table.forward("s", &packet(3)).await;

        assert_eq!(a_writer.payload_ids(), vec![1, 2, 3]);
        assert_eq!(b_writer.payload_ids(), vec![2, 3]);
    }

    #[tokio::test]
    async fn attach_to_unknown_source_fails() {
        let table = ForwardingTable::new();
        let (a, _) = sink(WriteMode::Accept);

        let err = table.attach(a, "missing").await.unwrap_err();
        assert_eq!(err.source_kind(), Some(&SourceErrorKind::SourceNotFoundError));
    }

    #[tokio::test]
    async fn attach_moves_sink_between_sources() {
        let table = ForwardingTable::new();
        table.add_source("q").await;
        table.add_source("h").await;
        let (a, a_writer) = sink(WriteMode::Accept);

        assert_eq!(table.attach(a.clone(), "q").await.unwrap(), None);
        assert_eq!(
            table.attach(a.clone(), "h").await.unwrap(),
            Some("q".to_string())
        );
        assert!(table.sink_ids("q").await.is_empty());
        assert_eq!(table.sink_ids("h").await, vec![a.id.clone()]);
        assert_eq!(table.source_of(&a.id).await, Some("h".to_string()));

        table.forward("q", &packet(1)).await;
        table.forward("h", &packet(2)).await;
        assert_eq!(a_writer.payload_ids(), vec![2]);
    }

    #[tokio::test]
    async fn no_consumer_keeps_every_sink_attached() {
        let table = ForwardingTable::new();
        table.add_source("s").await;
        let (a, a_writer) = sink(WriteMode::NoConsumer);
        let (b, b_writer) = sink(WriteMode::Accept);
        table.attach(a.clone(), "s").await.unwrap();
        table.attach(b.clone(), "s").await.unwrap();

        let report = table.forward("s", &packet(1)).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.no_consumer, 1);
        assert!(report.failed.is_empty());

        a_writer.set_mode(WriteMode::Accept);
        table.forward("s", &packet(2)).await;

        assert_eq!(a_writer.payload_ids(), vec![2]);
        assert_eq!(b_writer.payload_ids(), vec![1, 2]);
        assert_eq!(table.sink_ids("s").await.len(), 2);
    }

    #[tokio::test]
    async fn fatal_write_detaches_only_that_sink() {
        let table = ForwardingTable::new();
        table.add_source("s").await;
        let (a, _) = sink(WriteMode::Fail);
        let (b, b_writer) = sink(WriteMode::Accept);
        table.attach(a.clone(), "s").await.unwrap();
        table.attach(b.clone(), "s").await.unwrap();

        let report = table.forward("s", &packet(1)).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.id, a.id);
        assert_eq!(table.source_of(&a.id).await, None);

        table.forward("s", &packet(2)).await;
        assert_eq!(b_writer.payload_ids(), vec![1, 2]);
        assert_eq!(table.sink_ids("s").await, vec![b.id.clone()]);
    }

    #[tokio::test]
    async fn remove_source_returns_its_sinks() {
        let table = ForwardingTable::new();
        table.add_source("s").await;
        let (a, _) = sink(WriteMode::Accept);
        table.attach(a.clone(), "s").await.unwrap();

        let removed = table.remove_source("s").await;
        assert_eq!(removed.len(), 1);
        assert!(!table.contains_source("s").await);
        assert_eq!(table.source_of(&a.id).await, None);
        assert!(table.remove_source("s").await.is_empty());
    }

    #[tokio::test]
    async fn detach_waits_for_in_progress_fanout() {
        let table = Arc::new(ForwardingTable::new());
        table.add_source("s").await;
        let (a, a_writer) = sink(WriteMode::Accept);
        let (b, b_writer) = sink(WriteMode::Accept);
        table.attach(a.clone(), "s").await.unwrap();
        table.attach(b.clone(), "s").await.unwrap();

        let (entered, release) = a_writer.block_next_write();
        let forwarding = {
            let table = table.clone();
            tokio::spawn(async move { table.forward("s", &packet(1)).await })
        };
        entered.notified().await;

        let detaching = {
            let table = table.clone();
            let b_id = b.id.clone();
            tokio::spawn(async move { table.detach(&b_id).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!detaching.is_finished());

        release.notify_one();
        let report = forwarding.await.unwrap();
        assert_eq!(report.delivered, 2);
        assert!(detaching.await.unwrap().is_some());

        table.forward("s", &packet(2)).await;

        assert_eq!(a_writer.payload_ids(), vec![1, 2]);
        assert_eq!(b_writer.payload_ids(), vec![1]);
    }

    #[tokio::test]
    async fn stalled_sink_does_not_hold_up_other_sources() {
        let table = Arc::new(ForwardingTable::new());
        table.add_source("a").await;
        table.add_source("b").await;
        let (slow, slow_writer) = sink(WriteMode::Accept);
        let (late, late_writer) = sink(WriteMode::Accept);
        let (b, b_writer) = sink(WriteMode::Accept);
        table.attach(slow, "a").await.unwrap();
        table.attach(b, "b").await.unwrap();

        let (entered, release) = slow_writer.block_next_write();
        let forwarding = {
            let table = table.clone();
            tokio::spawn(async move { table.forward("a", &packet(1)).await })
        };
        entered.notified().await;

        let attaching = {
            let table = table.clone();
            tokio::spawn(async move { table.attach(late, "a").await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!attaching.is_finished());

        let report = tokio::time::timeout(
            Duration::from_millis(500),
            table.forward("b", &packet(2)),
        )
        .await
        .expect("fan-out of b waited on a");
        assert_eq!(report.delivered, 1);
        assert_eq!(b_writer.payload_ids(), vec![2]);

        release.notify_one();
        assert_eq!(forwarding.await.unwrap().delivered, 1);
        assert_eq!(attaching.await.unwrap().unwrap(), None);

        table.forward("a", &packet(3)).await;
        assert_eq!(slow_writer.payload_ids(), vec![1, 3]);
        assert_eq!(late_writer.payload_ids(), vec![3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_attach_detach_preserves_order() {
        let table = Arc::new(ForwardingTable::new());
        table.add_source("s").await;
        let sinks: Vec<(Arc<PacketSink>, Arc<RecordingWriter>)> =
            (0..6).map(|_| sink(WriteMode::Accept)).collect();

        let forwarding = {
            let table = table.clone();
            tokio::spawn(async move {
                for seq in 0..500u16 {
                    table.forward("s", &packet(seq)).await;
                    if seq % 50 == 0 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
            })
        };

        let churning = {
            let table = table.clone();
            let sinks: Vec<Arc<PacketSink>> = sinks.iter().map(|(s, _)| s.clone()).collect();
            tokio::spawn(async move {
                for round in 0..300usize {
                    let sink = &sinks[round % sinks.len()];
                    if round % 3 == 0 {
                        table.detach(&sink.id).await;
                    } else {
                        table.attach(sink.clone(), "s").await.unwrap();
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        forwarding.await.unwrap();
        churning.await.unwrap();

        for (_, writer) in sinks.iter() {
            let ids = writer.payload_ids();
            assert!(ids.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", ids);
            assert!(ids.iter().all(|id| *id < 500));
        }
    }
}
