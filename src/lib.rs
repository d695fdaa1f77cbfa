#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # rtp-fanout
//! rtp-fanout is the forwarding core of a WebRTC Selective Forwarding Unit. Publishers send one
//! media stream (or up to three simulcast layers) and every subscriber receives a copy of the RTP
//! packets without any decoding or re-encoding.
//!
//! The core ([`coordinator`], [`forwarding_table`], [`source`], [`sink`], [`feedback`]) only talks
//! to the traits in [`transport`]. [`publish_transport`] and [`subscribe_transport`] bind it to
//! [`webrtc::peer_connection::RTCPeerConnection`]. Signaling is left to the application, [`signal`]
//! only provides the base64 encoding used for copy/paste signaling.
//!
//! ## Usage
//! ```no_run
//! use rtp_fanout::{
//!     config::{ForwarderConfig, MediaConfig, WebRTCTransportConfig},
//!     coordinator::{SessionCoordinator, SourceSelector},
//!     publish_transport::PublishTransport,
//!     subscribe_transport::SubscribeTransport,
//! };
//! # use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
//! # async fn run(offer: RTCSessionDescription, viewer_offer: RTCSessionDescription) -> Result<(), rtp_fanout::error::Error> {
//! let coordinator = SessionCoordinator::new(ForwarderConfig::default());
//!
//! let publisher = PublishTransport::new(
//!     coordinator.clone(),
//!     MediaConfig::default(),
//!     WebRTCTransportConfig::default(),
//! )
//! .await?;
//! publisher.recv_video().await?;
//! let _answer = publisher.get_answer(offer).await?;
//! let source_id = publisher.wait_published().await?;
//!
//! let subscriber = SubscribeTransport::new(
//!     coordinator.clone(),
//!     MediaConfig::default(),
//!     WebRTCTransportConfig::default(),
//! )
//! .await?;
//! let (_sink_id, _answer) = subscriber
//!     .subscribe(SourceSelector::Source(source_id), viewer_offer)
//!     .await?;
//! # Ok(())
//! # }
//! ```

/// Configuration for [`coordinator::SessionCoordinator`], [`publish_transport::PublishTransport`] and [`subscribe_transport::SubscribeTransport`].
pub mod config;
/// SessionCoordinator owns publisher and subscriber sessions and wires sources to sinks.
pub mod coordinator;
pub mod error;
/// Periodic keyframe requests and bandwidth estimation sent to publishers.
pub mod feedback;
pub mod forwarding_table;
/// [`webrtc::peer_connection::RTCPeerConnection`] methods for publisher.
pub mod publish_transport;
pub mod session;
pub mod signal;
pub mod sink;
pub mod source;
/// [`webrtc::peer_connection::RTCPeerConnection`] methods for subscriber.
pub mod subscribe_transport;
/// Adapters between `webrtc` tracks and [`transport`] traits.
pub mod track;
pub mod transport;

#[cfg(test)]
mod test_util;
