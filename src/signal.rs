//! Copy/paste signaling: session descriptions as base64 encoded JSON.

use base64::{engine::general_purpose::STANDARD, Engine};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::Error;

pub fn encode(description: &RTCSessionDescription) -> Result<String, Error> {
    let json = serde_json::to_string(description)?;
    Ok(STANDARD.encode(json))
}

pub fn decode(encoded: &str) -> Result<RTCSessionDescription, Error> {
    let bytes = STANDARD.decode(encoded.trim())?;
    let description = serde_json::from_slice::<RTCSessionDescription>(&bytes)?;
    Ok(description)
}

#[cfg(test)]
mod tests {
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    use super::*;

    #[test]
    fn decodes_what_it_encodes_with_surrounding_whitespace() {
        let json = r#"{"type":"offer","sdp":"v=0\r\n"}"#;
        let encoded = format!("  {}\n", STANDARD.encode(json));

        let description = decode(&encoded).unwrap();
        assert_eq!(description.sdp_type, RTCSdpType::Offer);
        assert_eq!(description.sdp, "v=0\r\n");

        let again = decode(&encode(&description).unwrap()).unwrap();
        assert_eq!(again.sdp, description.sdp);
    }

    #[test]
    fn rejects_invalid_base64() {
        assert!(matches!(decode("not base64!"), Err(Error::Base64Error(_))));
    }

    #[test]
    fn rejects_invalid_json() {
        let encoded = STANDARD.encode("{\"type\":");
        assert!(matches!(decode(&encoded), Err(Error::JsonError(_))));
    }
}
