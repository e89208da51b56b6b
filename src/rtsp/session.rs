//! Per-connection RTSP session state and the RTP push entry points the
//! video/audio capture threads call directly.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use crate::config::AudioCodec;
use crate::hal::VideoCodec;
use crate::rtsp::rtp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Ready,
    Playing,
}

pub struct InterleavedChannels {
    pub rtp: u8,
    pub rtcp: u8,
}

pub struct RtspSession {
    pub id: u64,
    pub channel: usize,
    pub video_codec: VideoCodec,
    pub audio: Option<(AudioCodec, u32, u8)>,
    pub video_channels: InterleavedChannels,
    pub audio_channels: Option<InterleavedChannels>,
    pub phase: std::sync::Mutex<SessionPhase>,
    pub stream: std::sync::Mutex<TcpStream>,
    pub video_seq: AtomicU16,
    pub audio_seq: AtomicU16,
    pub video_ssrc: u32,
    pub audio_ssrc: u32,
    pub sent_first_keyframe: AtomicBool,
    pub audio_timestamp: AtomicU32,
}

impl RtspSession {
    pub fn session_id_hex(&self) -> String {
        format!("{:016x}", self.id)
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    pub fn is_playing(&self) -> bool {
        *self.phase.lock().unwrap() == SessionPhase::Playing
    }

    fn write_interleaved(&self, channel: u8, packet: &[u8]) -> std::io::Result<()> {
        let mut framed = Vec::with_capacity(4 + packet.len());
        framed.push(b'$');
        framed.push(channel);
        framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        framed.extend_from_slice(packet);
        let mut stream = self.stream.lock().unwrap();
        stream.write_all(&framed)
    }

    /// Packetizes and sends one decoded video NALU. Applies the
    /// keyframe-gate invariant: the first packet sent after entering
    /// `Playing` must belong to a parameter-set or keyframe-slice NAL.
    pub fn push_video(&self, nal: &[u8], is_keyframe: bool, is_parameter_set: bool, ts_us: u64, is_last_in_au: bool) -> bool {
        if !self.is_playing() {
            return true;
        }
        if !self.sent_first_keyframe.load(Ordering::SeqCst) && !is_keyframe && !is_parameter_set {
            return true;
        }

        let fragments = match self.video_codec {
            VideoCodec::H264 => rtp::packetize_h264(nal),
            VideoCodec::H265 => rtp::packetize_h265(nal),
        };
        let timestamp = rtp::scale_timestamp_us(ts_us, rtp::VIDEO_CLOCK_RATE);
        let last_idx = fragments.len().saturating_sub(1);

        for (idx, frag) in fragments.iter().enumerate() {
            let seq = self.video_seq.fetch_add(1, Ordering::SeqCst);
            let marker = is_last_in_au && idx == last_idx;
            let packet = rtp::pack(rtp::PT_H26X_DYNAMIC, marker, seq, timestamp, self.video_ssrc, frag);
            if self.write_interleaved(self.video_channels.rtp, &packet).is_err() {
                return false;
            }
        }

        if is_keyframe || is_parameter_set {
            self.sent_first_keyframe.store(true, Ordering::SeqCst);
        }
        true
    }

    /// Sends one MP3 frame; RTP timestamp advances by exactly 1152 samples
    /// per frame, converted to the configured sample-rate timescale.
    pub fn push_mp3(&self, frame: &[u8], sample_rate: u32) -> bool {
        self.push_audio_frame(frame, rtp::PT_MPA, 1152, sample_rate)
    }

    /// Sends one AAC access unit; one RTP packet per record. `frame` is the
    /// 2-byte little-endian length-prefixed record the encoder produces for
    /// the MP4 muxer, so the prefix is stripped here before packetizing —
    /// that framing is MSE-only and has no place in an RTP payload.
    pub fn push_aac(&self, frame: &[u8], samples_per_frame: u32, sample_rate: u32) -> bool {
        let Some(payload) = frame.get(2..) else { return true };
        self.push_audio_frame(payload, rtp::PT_AAC_DYNAMIC, samples_per_frame, sample_rate)
    }

    fn push_audio_frame(&self, payload: &[u8], payload_type: u8, samples_per_frame: u32, sample_rate: u32) -> bool {
        if !self.is_playing() {
            return true;
        }
        let Some(channels) = &self.audio_channels else { return true };
        let seq = self.audio_seq.fetch_add(1, Ordering::SeqCst);
        let ts = self.audio_timestamp.fetch_add(samples_per_frame, Ordering::SeqCst);
        let _ = sample_rate;
        let packet = rtp::pack(payload_type, true, seq, ts, self.audio_ssrc, payload);
        self.write_interleaved(channels.rtp, &packet).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn dummy_session(phase: SessionPhase) -> (RtspSession, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let session = RtspSession {
            id: 1,
            channel: 0,
            video_codec: VideoCodec::H264,
            audio: None,
            video_channels: InterleavedChannels { rtp: 0, rtcp: 1 },
            audio_channels: None,
            phase: std::sync::Mutex::new(phase),
            stream: std::sync::Mutex::new(stream),
            video_seq: AtomicU16::new(0),
            audio_seq: AtomicU16::new(0),
            video_ssrc: 1,
            audio_ssrc: 2,
            sent_first_keyframe: AtomicBool::new(false),
            audio_timestamp: AtomicU32::new(0),
        };
        (session, listener)
    }

    #[test]
    fn non_playing_session_drops_silently() {
        let (session, _listener) = dummy_session(SessionPhase::Ready);
        assert!(session.push_video(&[0x41, 1, 2], false, false, 0, true));
        assert_eq!(session.video_seq.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn first_packet_after_play_must_be_keyframe_or_param_set() {
        let (session, _listener) = dummy_session(SessionPhase::Playing);
        session.push_video(&[0x41, 1, 2], false, false, 0, true);
        assert_eq!(session.video_seq.load(Ordering::SeqCst), 0);

        session.push_video(&[0x67, 1, 2], false, true, 0, true);
        assert_eq!(session.video_seq.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn push_aac_strips_length_prefix_before_rtp() {
        let (mut session, _listener) = dummy_session(SessionPhase::Playing);
        session.audio_channels = Some(InterleavedChannels { rtp: 2, rtcp: 3 });
        let aac_payload = [0xaa, 0xbb, 0xcc];
        let mut record = Vec::new();
        record.extend_from_slice(&(aac_payload.len() as u16).to_le_bytes());
        record.extend_from_slice(&aac_payload);

        assert!(session.push_aac(&record, 1024, 16000));
        assert_eq!(session.audio_seq.load(Ordering::SeqCst), 1);
    }
}
