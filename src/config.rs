use std::{net::IpAddr, sync::Arc, time::Duration};

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use webrtc::{
    api::setting_engine::SettingEngine, peer_connection::configuration::RTCConfiguration,
    rtp_transceiver::rtp_codec::RTCRtpCodecParameters, sdp::extmap,
};
use webrtc_ice::network_type::NetworkType;

const EXT_TOFFSET: &str = "urn:ietf:params:rtp-hdrext:toffset";

/// Period of the keyframe request sent upstream for every live source.
pub const DEFAULT_FEEDBACK_INTERVAL: Duration = Duration::from_secs(3);
/// REMB value that keeps browsers sending every simulcast layer.
pub const DEFAULT_REMB_BITRATE: f32 = 10_000_000.0;

/// Configuration for [`crate::publish_transport::PublishTransport`] and [`crate::subscribe_transport::SubscribeTransport`].
#[derive(Derivative)]
#[derivative(Clone, Debug)]
pub struct WebRTCTransportConfig {
    #[derivative(Debug = "ignore")]
    pub configuration: RTCConfiguration,
    pub announced_ips: Vec<IpAddr>,
    pub ice_disconnected_timeout: Option<Duration>,
    pub ice_failed_timeout: Option<Duration>,
    pub ice_keep_alive_interval: Option<Duration>,
    pub network_types: Vec<NetworkType>,
    pub ice_username_fragment: Option<String>,
    pub ice_password: Option<String>,
}

impl Default for WebRTCTransportConfig {
    fn default() -> Self {
        Self {
            configuration: RTCConfiguration {
                ..Default::default()
            },
            announced_ips: vec![],
            ice_disconnected_timeout: None,
            ice_failed_timeout: None,
            ice_keep_alive_interval: None,
            network_types: vec![],
            ice_username_fragment: None,
            ice_password: None,
        }
    }
}

impl WebRTCTransportConfig {
    pub fn configuration(&self) -> RTCConfiguration {
        self.configuration.clone()
    }

    pub(crate) fn setting_engine(&self) -> SettingEngine {
        let mut setting_engine = SettingEngine::default();

        if self.ice_disconnected_timeout.is_some()
            || self.ice_failed_timeout.is_some()
            || self.ice_keep_alive_interval.is_some()
        {
            setting_engine.set_ice_timeouts(
                self.ice_disconnected_timeout,
                self.ice_failed_timeout,
                self.ice_keep_alive_interval,
            );
        }

        if !self.announced_ips.is_empty() {
            let announced_ips = Arc::new(self.announced_ips.clone());
            setting_engine.set_ip_filter(Box::new(move |ip| announced_ips.contains(&ip)));
        }

        if !self.network_types.is_empty() {
            setting_engine.set_network_types(self.network_types.clone());
        }

        if self.ice_username_fragment.is_some() || self.ice_password.is_some() {
            let username = self.ice_username_fragment.clone().unwrap_or_default();
            let password = self.ice_password.clone().unwrap_or_default();
            setting_engine.set_ice_credentials(username, password);
        }

        setting_engine
    }
}

/// Media configuration about codec and header extension for the peer connections.
#[derive(Clone, Debug, Default)]
pub struct MediaConfig {
    pub codec: CodecConfig,
    pub header_extension: HeaderExtensionConfig,
}

/// Media codec configuration for audio and video. Both empty means the default codecs of `webrtc`.
#[derive(Clone, Debug, Default)]
pub struct CodecConfig {
    pub audio: Vec<RTCRtpCodecParameters>,
    pub video: Vec<RTCRtpCodecParameters>,
}

impl CodecConfig {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && self.video.is_empty()
    }
}

/// Header extension configuration for audio and video.
#[derive(Clone, Debug)]
pub struct HeaderExtensionConfig {
    pub audio: Vec<String>,
    pub video: Vec<String>,
}

impl Default for HeaderExtensionConfig {
    fn default() -> Self {
        Self {
            audio: vec![
                extmap::AUDIO_LEVEL_URI.to_owned(),
                extmap::ABS_SEND_TIME_URI.to_owned(),
                extmap::TRANSPORT_CC_URI.to_owned(),
                extmap::SDES_MID_URI.to_owned(),
            ],
            video: vec![
                EXT_TOFFSET.to_string(),
                extmap::SDES_MID_URI.to_owned(),
                extmap::SDES_RTP_STREAM_ID_URI.to_owned(),
                extmap::SDES_REPAIR_RTP_STREAM_ID_URI.to_owned(),
                extmap::ABS_SEND_TIME_URI.to_owned(),
            ],
        }
    }
}

/// Configuration for [`crate::coordinator::SessionCoordinator`].
#[derive(Clone, Debug)]
pub struct ForwarderConfig {
    /// Period of PLI (and REMB for simulcast) feedback per source.
    pub feedback_interval: Duration,
    /// Bitrate announced in REMB feedback to simulcast publishers.
    pub remb_bitrate: f32,
    /// Capacity of the notice channel returned by `subscribe_notices`.
    pub notice_capacity: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            feedback_interval: DEFAULT_FEEDBACK_INTERVAL,
            remb_bitrate: DEFAULT_REMB_BITRATE,
            notice_capacity: 1024,
        }
    }
}

/// Simulcast quality layer, identified on the wire by its RTP stream id.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
pub enum Rid {
    #[strum(serialize = "q")]
    #[serde(rename = "q")]
    Quarter,
    #[strum(serialize = "h")]
    #[serde(rename = "h")]
    Half,
    #[strum(serialize = "f")]
    #[serde(rename = "f")]
    Full,
}

impl Rid {
    /// Parses a layer tag, `None` for tags that are not one of the three layers.
    pub fn from_tag(tag: &str) -> Option<Rid> {
        tag.parse().ok()
    }
}
