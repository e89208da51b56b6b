//! SDP generation for the RTSP DESCRIBE response: describe exactly one video
//! track and, optionally, one audio track, as a plain RTSP media description
//! with no ICE/crypto/candidates.

use crate::config::AudioCodec;
use crate::hal::VideoCodec;

pub struct SdpParams {
    pub session_name: String,
    pub server_addr: String,
    pub video_codec: VideoCodec,
    pub audio: Option<AudioSdpParams>,
}

pub struct AudioSdpParams {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u8,
}

/// Builds the SDP body DESCRIBE returns. Video always uses dynamic payload
/// type 96; audio uses static type 14 (MPA) for MP3 with `layer=3`, or a
/// dynamic `mpeg4-generic` type for AAC.
pub fn generate(params: &SdpParams) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!("o=- 0 0 IN IP4 {}\r\n", params.server_addr));
    sdp.push_str(&format!("s={}\r\n", params.session_name));
    sdp.push_str(&format!("c=IN IP4 {}\r\n", params.server_addr));
    sdp.push_str("t=0 0\r\n");
    sdp.push_str("a=tool:camerad\r\n");
    sdp.push_str("a=range:npt=0-\r\n");
    sdp.push_str("a=control:*\r\n");

    let video_rtpmap = match params.video_codec {
        VideoCodec::H264 => "H264/90000",
        VideoCodec::H265 => "H265/90000",
    };
    sdp.push_str("m=video 0 RTP/AVP 96\r\n");
    sdp.push_str("a=control:track1\r\n");
    sdp.push_str(&format!("a=rtpmap:96 {video_rtpmap}\r\n"));
    match params.video_codec {
        VideoCodec::H264 => sdp.push_str("a=fmtp:96 packetization-mode=1\r\n"),
        VideoCodec::H265 => {}
    }

    if let Some(audio) = &params.audio {
        match audio.codec {
            AudioCodec::Mp3 => {
                sdp.push_str(&format!("m=audio 0 RTP/AVP {}\r\n", crate::rtsp::rtp::PT_MPA));
                sdp.push_str("a=control:track2\r\n");
                sdp.push_str(&format!(
                    "a=rtpmap:{} MPA/{}\r\n",
                    crate::rtsp::rtp::PT_MPA,
                    audio.sample_rate
                ));
                sdp.push_str(&format!("a=fmtp:{} layer=3\r\n", crate::rtsp::rtp::PT_MPA));
            }
            AudioCodec::Aac => {
                let pt = crate::rtsp::rtp::PT_AAC_DYNAMIC;
                sdp.push_str(&format!("m=audio 0 RTP/AVP {pt}\r\n"));
                sdp.push_str("a=control:track2\r\n");
                sdp.push_str(&format!("a=rtpmap:{pt} mpeg4-generic/{}/{}\r\n", audio.sample_rate, audio.channels));
                sdp.push_str(&format!(
                    "a=fmtp:{pt} streamtype=5;profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3\r\n"
                ));
            }
        }
    }

    sdp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_video_only_session() {
        let sdp = generate(&SdpParams {
            session_name: "camerad".into(),
            server_addr: "192.0.2.1".into(),
            video_codec: VideoCodec::H264,
            audio: None,
        });
        assert!(sdp.contains("m=video 0 RTP/AVP 96"));
        assert!(!sdp.contains("m=audio"));
    }

    #[test]
    fn describes_mp3_audio_with_layer_fmtp() {
        let sdp = generate(&SdpParams {
            session_name: "camerad".into(),
            server_addr: "192.0.2.1".into(),
            video_codec: VideoCodec::H265,
            audio: Some(AudioSdpParams { codec: AudioCodec::Mp3, sample_rate: 44100, channels: 2 }),
        });
        assert!(sdp.contains("m=audio 0 RTP/AVP 14"));
        assert!(sdp.contains("a=fmtp:14 layer=3"));
        assert!(sdp.contains("H265/90000"));
    }

    #[test]
    fn describes_aac_audio_with_mpeg4_generic() {
        let sdp = generate(&SdpParams {
            session_name: "camerad".into(),
            server_addr: "192.0.2.1".into(),
            video_codec: VideoCodec::H264,
            audio: Some(AudioSdpParams { codec: AudioCodec::Aac, sample_rate: 16000, channels: 1 }),
        });
        assert!(sdp.contains("mpeg4-generic/16000/1"));
    }
}
