use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use webrtc::rtcp::payload_feedbacks::{
    picture_loss_indication::PictureLossIndication,
    receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate,
};

use crate::transport::{FeedbackSender, RtcpPacket};

/// Periodic upstream feedback for one live source.
///
/// Every tick sends a PLI so that late joiners get a keyframe within one interval. Simulcast
/// publishers also get a REMB so the browser keeps every layer at full bitrate.
#[derive(Debug, Clone)]
pub struct FeedbackScheduler {
    interval: Duration,
    remb_bitrate: Option<f32>,
}

impl FeedbackScheduler {
    pub fn new(interval: Duration, remb_bitrate: Option<f32>) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            remb_bitrate,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts the timer. The first feedback goes out one interval from now, nothing is sent
    /// once `token` is cancelled.
    pub fn spawn(
        &self,
        source_id: String,
        media_ssrc: u32,
        sender: Arc<dyn FeedbackSender>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        let start = Instant::now() + self.interval;
        tokio::spawn(async move {
            tracing::debug!(
                "FeedbackScheduler source={} ssrc={} has started, interval={:?}",
                source_id,
                media_ssrc,
                scheduler.interval
            );
            let mut ticker = tokio::time::interval_at(start, scheduler.interval);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        for packet in scheduler.packets(media_ssrc) {
                            if let Err(err) = sender.send_feedback(packet) {
                                tracing::warn!(
                                    "FeedbackScheduler source={} ssrc={} failed to send feedback: {}",
                                    source_id,
                                    media_ssrc,
                                    err
                                );
                            }
                        }
                    }
                }
            }
            tracing::debug!(
                "FeedbackScheduler source={} ssrc={} has finished",
                source_id,
                media_ssrc
            );
        })
    }

    fn packets(&self, media_ssrc: u32) -> Vec<RtcpPacket> {
        let mut packets: Vec<RtcpPacket> = vec![Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        })];
        if let Some(bitrate) = self.remb_bitrate {
            packets.push(Box::new(ReceiverEstimatedMaximumBitrate {
                sender_ssrc: media_ssrc,
                bitrate,
                ssrcs: vec![],
            }));
        }
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{RecordingFeedback, SentFeedback};

    #[tokio::test(start_paused = true)]
    async fn sends_three_plis_in_ten_seconds() {
        let feedback = RecordingFeedback::new();
        let token = CancellationToken::new();
        let scheduler = FeedbackScheduler::new(Duration::from_secs(3), None);
        let handle = scheduler.spawn("source".to_string(), 42, feedback.clone(), token.clone());

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(feedback.pli_count(), 0);

        tokio::time::sleep(Duration::from_millis(7100)).await;
        assert_eq!(feedback.pli_count(), 3);
        assert_eq!(feedback.remb_count(), 0);
        assert!(feedback
            .sent()
            .iter()
            .all(|f| *f == SentFeedback::Pli { media_ssrc: 42 }));

        token.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(feedback.pli_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn simulcast_adds_remb() {
        let feedback = RecordingFeedback::new();
        let token = CancellationToken::new();
        let scheduler = FeedbackScheduler::new(Duration::from_secs(3), Some(10_000_000.0));
        let handle = scheduler.spawn("source".to_string(), 7, feedback.clone(), token.clone());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(
            feedback.sent(),
            vec![
                SentFeedback::Pli { media_ssrc: 7 },
                SentFeedback::Remb {
                    sender_ssrc: 7,
                    bitrate: 10_000_000.0
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_running_when_sending_fails() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<RtcpPacket>();
        drop(rx);
        let token = CancellationToken::new();
        let scheduler = FeedbackScheduler::new(Duration::from_secs(3), None);
        let handle = scheduler.spawn("source".to_string(), 1, Arc::new(tx), token.clone());

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(!handle.is_finished());

        token.cancel();
        handle.await.unwrap();
    }
}
