//! RTSP session engine: one accept-loop thread, one reader thread per
//! connection, and a shared session list that the video/audio capture
//! threads lock to broadcast RTP packets to playing sessions.

pub mod rtp;
pub mod sdp;
pub mod session;

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{AudioCodec, RtspConfig};
use crate::hal::{ChannelId, Hal, VideoCodec};
use session::{InterleavedChannels, RtspSession, SessionPhase};

pub struct RtspServer {
    sessions: Mutex<HashMap<u64, Arc<RtspSession>>>,
    video_codec: VideoCodec,
    audio: Option<(AudioCodec, u32, u8)>,
    channel: usize,
    server_addr: String,
    hal: Arc<dyn Hal>,
}

impl RtspServer {
    pub fn new(
        video_codec: VideoCodec,
        audio: Option<(AudioCodec, u32, u8)>,
        channel: usize,
        server_addr: String,
        hal: Arc<dyn Hal>,
    ) -> Arc<Self> {
        Arc::new(RtspServer { sessions: Mutex::new(HashMap::new()), video_codec, audio, channel, server_addr, hal })
    }

    pub fn spawn(self: &Arc<Self>, config: &RtspConfig) -> std::io::Result<()> {
        let listener = TcpListener::bind((config.bind.as_str(), config.port))?;
        let server = self.clone();
        std::thread::Builder::new().name("rtsp-accept".into()).spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let server = server.clone();
                std::thread::Builder::new()
                    .name("rtsp-conn".into())
                    .spawn(move || server.handle_connection(stream))
                    .ok();
            }
        })?;
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream) {
        let write_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut reader = BufReader::new(stream);
        let mut current_session: Option<Arc<RtspSession>> = None;

        loop {
            let Some((method, uri, headers, cseq)) = read_request(&mut reader) else { break };

            let response = match method.as_str() {
                "OPTIONS" => options_response(cseq),
                "DESCRIBE" => self.describe_response(cseq),
                "SETUP" => self.setup_response(cseq, &headers, &write_stream, &mut current_session),
                "PLAY" => self.play_response(cseq, &headers, &current_session),
                "TEARDOWN" => {
                    self.teardown(&headers, &current_session);
                    current_session = None;
                    teardown_response(cseq)
                }
                _ => not_found_response(cseq),
            };
            let _ = uri;

            let mut w = match write_stream.try_clone() {
                Ok(w) => w,
                Err(_) => break,
            };
            if w.write_all(response.as_bytes()).is_err() {
                break;
            }
        }

        if let Some(session) = current_session {
            self.sessions.lock().remove(&session.id);
        }
    }

    fn describe_response(&self, cseq: u32) -> String {
        let body = sdp::generate(&sdp::SdpParams {
            session_name: "camerad".into(),
            server_addr: self.server_addr.clone(),
            video_codec: self.video_codec,
            audio: self.audio.map(|(codec, sample_rate, channels)| sdp::AudioSdpParams { codec, sample_rate, channels }),
        });
        format!(
            "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nContent-Base: rtsp://{}/\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{}",
            self.server_addr,
            body.len(),
            body
        )
    }

    fn setup_response(
        &self,
        cseq: u32,
        headers: &HashMap<String, String>,
        write_stream: &TcpStream,
        current_session: &mut Option<Arc<RtspSession>>,
    ) -> String {
        let Some(transport) = headers.get("transport") else {
            return bad_request_response(cseq);
        };
        if !transport.contains("RTP/AVP/TCP") {
            // UDP transport is rejected outright; this engine only serves
            // interleaved RTP over the RTSP TCP connection.
            return format!("RTSP/1.0 461 Unsupported Transport\r\nCSeq: {cseq}\r\n\r\n");
        }
        let Some(interleaved) = parse_interleaved(transport) else {
            return bad_request_response(cseq);
        };

        let is_audio_track = headers.get("_setup_uri").map(|u| u.ends_with("track2")).unwrap_or(false);

        let session = match current_session.take() {
            Some(existing) => existing,
            None => {
                let id = new_session_id();
                Arc::new(RtspSession {
                    id,
                    channel: self.channel,
                    video_codec: self.video_codec,
                    audio: self.audio,
                    video_channels: InterleavedChannels { rtp: 0, rtcp: 1 },
                    audio_channels: None,
                    phase: std::sync::Mutex::new(SessionPhase::Init),
                    stream: std::sync::Mutex::new(write_stream.try_clone().expect("clone rtsp stream")),
                    video_seq: AtomicU16::new(0),
                    audio_seq: AtomicU16::new(0),
                    video_ssrc: rand_u32(),
                    audio_ssrc: rand_u32(),
                    sent_first_keyframe: AtomicBool::new(false),
                    audio_timestamp: AtomicU32::new(0),
                })
            }
        };

        // audio_channels lives behind an Arc<RtspSession> built once at
        // SETUP time; since it's immutable after construction, a second
        // SETUP for the audio track rebuilds the session with the field
        // populated, matching this engine's one-SETUP-per-track contract.
        let session = if is_audio_track && session.audio_channels.is_none() {
            Arc::new(RtspSession {
                id: session.id,
                channel: session.channel,
                video_codec: session.video_codec,
                audio: session.audio,
                video_channels: InterleavedChannels { rtp: session.video_channels.rtp, rtcp: session.video_channels.rtcp },
                audio_channels: Some(InterleavedChannels { rtp: interleaved.0, rtcp: interleaved.1 }),
                phase: std::sync::Mutex::new(SessionPhase::Ready),
                stream: std::sync::Mutex::new(write_stream.try_clone().expect("clone rtsp stream")),
                video_seq: AtomicU16::new(0),
                audio_seq: AtomicU16::new(0),
                video_ssrc: session.video_ssrc,
                audio_ssrc: session.audio_ssrc,
                sent_first_keyframe: AtomicBool::new(false),
                audio_timestamp: AtomicU32::new(0),
            })
        } else {
            session.set_phase(SessionPhase::Ready);
            session
        };

        self.sessions.lock().insert(session.id, session.clone());
        *current_session = Some(session.clone());

        format!(
            "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: {};timeout=60\r\nTransport: RTP/AVP/TCP;unicast;interleaved={}-{}\r\n\r\n",
            session.session_id_hex(),
            interleaved.0,
            interleaved.1
        )
    }

    fn play_response(&self, cseq: u32, headers: &HashMap<String, String>, current_session: &Option<Arc<RtspSession>>) -> String {
        let Some(session) = current_session else {
            return bad_request_response(cseq);
        };
        if let Some(expected) = headers.get("session") {
            if !expected.starts_with(&session.session_id_hex()) {
                return bad_request_response(cseq);
            }
        }
        session.set_phase(SessionPhase::Playing);
        if let Err(err) = self.hal.channel_request_idr(session.channel as ChannelId) {
            tracing::warn!(?err, channel = session.channel, "idr request on play failed");
        }
        format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nSession: {}\r\nRange: npt=0.000-\r\n\r\n", session.session_id_hex())
    }

    fn teardown(&self, _headers: &HashMap<String, String>, current_session: &Option<Arc<RtspSession>>) {
        if let Some(session) = current_session {
            self.sessions.lock().remove(&session.id);
        }
    }

    /// Broadcasts one decoded video NALU to every playing session bound to
    /// `channel`. Called directly from the video capture thread.
    pub fn push_video(&self, channel: ChannelId, nal: &[u8], is_keyframe: bool, is_parameter_set: bool, ts_us: u64, is_last_in_au: bool) {
        let sessions = self.sessions.lock();
        let mut dead = Vec::new();
        for session in sessions.values() {
            if session.channel != channel as usize {
                continue;
            }
            if !session.push_video(nal, is_keyframe, is_parameter_set, ts_us, is_last_in_au) {
                dead.push(session.id);
            }
        }
        drop(sessions);
        if !dead.is_empty() {
            let mut sessions = self.sessions.lock();
            for id in dead {
                sessions.remove(&id);
            }
        }
    }

    pub fn push_mp3(&self, channel: ChannelId, frame: &[u8], sample_rate: u32) {
        self.broadcast_audio(channel, |s| s.push_mp3(frame, sample_rate));
    }

    pub fn push_aac(&self, channel: ChannelId, frame: &[u8], samples_per_frame: u32, sample_rate: u32) {
        self.broadcast_audio(channel, |s| s.push_aac(frame, samples_per_frame, sample_rate));
    }

    fn broadcast_audio(&self, channel: ChannelId, f: impl Fn(&RtspSession) -> bool) {
        let sessions = self.sessions.lock();
        let mut dead = Vec::new();
        for session in sessions.values() {
            if session.channel != channel as usize {
                continue;
            }
            if !f(session) {
                dead.push(session.id);
            }
        }
        drop(sessions);
        if !dead.is_empty() {
            let mut sessions = self.sessions.lock();
            for id in dead {
                sessions.remove(&id);
            }
        }
    }
}

fn options_response(cseq: u32) -> String {
    format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\nPublic: DESCRIBE, SETUP, PLAY, TEARDOWN\r\n\r\n")
}

fn teardown_response(cseq: u32) -> String {
    format!("RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n\r\n")
}

fn bad_request_response(cseq: u32) -> String {
    format!("RTSP/1.0 400 Bad Request\r\nCSeq: {cseq}\r\n\r\n")
}

fn not_found_response(cseq: u32) -> String {
    format!("RTSP/1.0 404 Not Found\r\nCSeq: {cseq}\r\n\r\n")
}

fn read_request(reader: &mut BufReader<TcpStream>) -> Option<(String, String, HashMap<String, String>, u32)> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).ok()? == 0 {
        return None;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let uri = parts.next()?.to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    headers.insert("_setup_uri".to_string(), uri.clone());

    let cseq = headers.get("cseq").and_then(|v| v.parse().ok()).unwrap_or(0);
    Some((method, uri, headers, cseq))
}

fn parse_interleaved(transport: &str) -> Option<(u8, u8)> {
    for part in transport.split(';') {
        if let Some(rest) = part.trim().strip_prefix("interleaved=") {
            let (a, b) = rest.split_once('-')?;
            return Some((a.parse().ok()?, b.parse().ok()?));
        }
    }
    None
}

fn new_session_id() -> u64 {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf).expect("system RNG unavailable");
    u64::from_be_bytes(buf)
}

fn rand_u32() -> u32 {
    let mut buf = [0u8; 4];
    getrandom::getrandom(&mut buf).expect("system RNG unavailable");
    u32::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interleaved_range() {
        assert_eq!(parse_interleaved("RTP/AVP/TCP;unicast;interleaved=0-1"), Some((0, 1)));
        assert_eq!(parse_interleaved("RTP/AVP/TCP;unicast;interleaved=2-3"), Some((2, 3)));
        assert_eq!(parse_interleaved("RTP/AVP/UDP;unicast"), None);
    }

    #[test]
    fn options_lists_supported_methods() {
        let resp = options_response(5);
        assert!(resp.contains("CSeq: 5"));
        assert!(resp.contains("DESCRIBE, SETUP, PLAY, TEARDOWN"));
    }

    #[test]
    fn session_ids_are_64_bit_hex() {
        let id = new_session_id();
        let hex = format!("{id:016x}");
        assert_eq!(hex.len(), 16);
    }
}
