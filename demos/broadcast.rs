use std::env;

use rtp_fanout::{
    config::{ForwarderConfig, MediaConfig},
    coordinator::{SessionCoordinator, SourceSelector},
    publish_transport::PublishTransport,
    signal,
    subscribe_transport::SubscribeTransport,
};

mod common;

#[actix_web::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::init_tracing();

    let port = env::var("PORT")
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(8080);
    let mut offers = common::sdp_server::start(port)?;

    let coordinator = SessionCoordinator::new(ForwarderConfig::default());
    let config = common::transport_config();

    let Some(body) = offers.recv().await else {
        return Ok(());
    };
    let offer = signal::decode(&body)?;
    println!();

    let publisher =
        PublishTransport::new(coordinator.clone(), MediaConfig::default(), config.clone()).await?;
    publisher.recv_video().await?;
    let answer = publisher.get_answer(offer).await?;
    println!("{}", signal::encode(&answer)?);

    let source_id = publisher.wait_published().await?;
    tracing::info!("Broadcasting source {}", source_id);

    let mut subscribers = vec![];
    loop {
        println!();
        println!("Curl an base64 SDP to start sendonly peer connection");

        let Some(body) = offers.recv().await else {
            break;
        };
        let offer = match signal::decode(&body) {
            Ok(offer) => offer,
            Err(err) => {
                tracing::error!("Invalid offer: {}", err);
                continue;
            }
        };

        let subscriber =
            SubscribeTransport::new(coordinator.clone(), MediaConfig::default(), config.clone())
                .await?;
        match subscriber
            .subscribe(SourceSelector::Source(source_id.clone()), offer)
            .await
        {
            Ok((sink_id, answer)) => {
                tracing::info!("Subscriber {} receives through sink {}", subscriber.id, sink_id);
                println!("{}", signal::encode(&answer)?);
                subscribers.push(subscriber);
            }
            Err(err) => {
                tracing::error!("Failed to subscribe: {}", err);
                let _ = subscriber.close().await;
            }
        }
    }

    for subscriber in subscribers {
        subscriber.close().await?;
    }
    publisher.close().await?;
    coordinator.close().await?;
    Ok(())
}
