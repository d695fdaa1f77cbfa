use std::sync::Arc;

use rtp_fanout::{
    config::{ForwarderConfig, MediaConfig, Rid},
    coordinator::{CoordinatorNotice, SessionCoordinator, SourceSelector},
    publish_transport::PublishTransport,
    signal,
    track::LocalTrackWriter,
};
use strum::IntoEnumIterator;
use tokio::io::{AsyncBufReadExt, BufReader};
use webrtc::{
    api::media_engine::MIME_TYPE_VP8, rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::track_local_static_rtp::TrackLocalStaticRTP,
};

mod common;

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::init_tracing();

    let coordinator = SessionCoordinator::new(ForwarderConfig::default());
    let publisher = PublishTransport::new(
        coordinator.clone(),
        MediaConfig::default(),
        common::transport_config(),
    )
    .await?;

    // Every layer is echoed back to the browser on its own track.
    let echo = coordinator.open_subscriber().await?;
    coordinator.offer_received(&echo).await?;
    coordinator.answer_sent(&echo).await?;
    for rid in Rid::iter() {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            format!("video_{}", rid),
            format!("rtp-fanout_{}", rid),
        ));
        publisher.add_output_track(track.clone()).await?;
        coordinator
            .on_subscriber_join(
                &echo,
                SourceSelector::Layer {
                    publisher_id: publisher.id.clone(),
                    rid,
                },
                Arc::new(LocalTrackWriter::new(track)),
            )
            .await?;
    }

    let offer = signal::decode(&read_offer().await?)?;
    let answer = publisher.get_answer(offer).await?;
    println!("Paste below base64 in browser:\n{}", signal::encode(&answer)?);

    let mut notices = coordinator.subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            if let CoordinatorNotice::SourcePublished { source_id, rid, .. } = notice {
                println!("Track has started: source={} rid={:?}", source_id, rid);
            }
        }
    });

    tokio::signal::ctrl_c().await?;

    publisher.close().await?;
    coordinator.close().await?;
    Ok(())
}

async fn read_offer() -> std::io::Result<String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if !line.is_empty() {
            return Ok(line);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "no offer on stdin",
    ))
}
