use actix_web::{web::Data, App, HttpResponse, HttpServer, Responder};
use tokio::sync::mpsc;
use tracing_actix_web::TracingLogger;

/// Starts the HTTP endpoint on `port`. Every `POST /sdp` body is delivered through the returned receiver.
pub fn start(port: u16) -> std::io::Result<mpsc::UnboundedReceiver<String>> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let sender = Data::new(tx);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(sender.clone())
            .service(sdp)
    })
    .bind(("0.0.0.0", port))?
    .run();
    actix_web::rt::spawn(server);

    tracing::info!("SDP endpoint listens on port {}", port);
    Ok(rx)
}

#[actix_web::post("/sdp")]
async fn sdp(body: String, sender: Data<mpsc::UnboundedSender<String>>) -> impl Responder {
    match sender.send(body) {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(_) => HttpResponse::ServiceUnavailable().body("not accepting offers"),
    }
}
