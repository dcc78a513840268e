//! SDP document piped into the recorder
//!
//! The recorder learns where to listen and how to depacketize each stream
//! from this description; nothing else about the session reaches it.

use std::fmt::Write;

use super::{RecordingDescription, RelayDescriptor};
use crate::error::{Result, SfuError};

pub fn create_sdp_text(description: &RecordingDescription) -> Result<String> {
    if description.is_empty() {
        return Err(SfuError::InvalidDescription(format!(
            "no media to record for {}",
            description.file_name
        )));
    }

    let mut sdp = String::from(
        "v=0\r\n\
         o=- 0 0 IN IP4 127.0.0.1\r\n\
         s=FFmpeg\r\n\
         c=IN IP4 127.0.0.1\r\n\
         t=0 0\r\n",
    );

    if let Some(video) = &description.video {
        push_media(&mut sdp, "video", video);
    }
    if let Some(audio) = &description.audio {
        push_media(&mut sdp, "audio", audio);
    }

    Ok(sdp)
}

fn push_media(sdp: &mut String, kind: &str, relay: &RelayDescriptor) {
    let codec = &relay.codec;
    // Writing into a String cannot fail
    let _ = write!(sdp, "m={kind} {} RTP/AVP {}\r\n", relay.port, codec.payload_type);
    let _ = match codec.channels {
        Some(channels) if channels > 1 => write!(
            sdp,
            "a=rtpmap:{} {}/{}/{channels}\r\n",
            codec.payload_type, codec.codec_name, codec.clock_rate
        ),
        _ => write!(
            sdp,
            "a=rtpmap:{} {}/{}\r\n",
            codec.payload_type, codec.codec_name, codec.clock_rate
        ),
    };
    if let Some(rtcp_port) = relay.rtcp_port {
        let _ = write!(sdp, "a=rtcp:{rtcp_port}\r\n");
    }
    sdp.push_str("a=sendonly\r\n");
}
