//! Control-API route table. Ports `respond_request()`'s dispatch chain:
//! each route is tried against the request's path, query string driving
//! both inline reconfiguration and streaming client registration.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::config::AudioCodec as CfgAudioCodec;
use crate::delivery::{ClientRow, SinkKind};
use crate::hal::VideoCodec;
use crate::mp4::Mp4ClientState;
use crate::nightmode::Mode;

use super::server::{send_error, AppState, Request};

pub fn dispatch(state: &AppState, request: &Request, stream: TcpStream) {
    match request.uri.as_str() {
        "/" | "/index.htm" | "/index.html" => send_index(stream),
        "/exit" => handle_exit(state, stream),
        "/api/status" => handle_status(state, stream),
        "/api/time" => handle_time(state, request, stream),
        "/api/night" => handle_night(state, request, stream),
        "/api/record" => handle_record(state, request, stream),
        "/api/cmd" => handle_cmd(state, request, stream),
        "/api/isp" => handle_isp(state, stream),
        "/api/mp4" => handle_mp4(state, request, stream),
        "/api/audio" => handle_audio(state, request, stream),
        "/audio.pcm" => register_stream(state, stream, request, 0, "audio/pcm", SinkKind::Pcm),
        "/video.264" | "/video.265" => register_h26x(state, stream, request),
        "/video.mp4" => register_mp4(state, stream, request),
        "/mjpeg" => register_mjpeg(state, stream, request),
        "/api/mjpeg" | "/api/jpeg" => handle_mjpeg_reconfigure(state, request, stream),
        "/image.jpg" => handle_snapshot(state, request, stream),
        uri if uri.starts_with("/api/osd/") => handle_osd(state, request, stream, uri),
        _ => {
            let mut stream = stream;
            send_error(&mut stream, 400);
        }
    }
}

fn send_index(mut stream: TcpStream) {
    let body = "<html><head><title>camera</title></head><body>camerad control API</body></html>";
    let response =
        format!("HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}", body.len());
    let _ = stream.write_all(response.as_bytes());
}

fn json_response(mut stream: TcpStream, body: String) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json;charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
}

fn handle_exit(state: &AppState, stream: TcpStream) {
    let mut stream = stream;
    let body = "Closing...";
    let response =
        format!("HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}", body.len());
    let _ = stream.write_all(response.as_bytes());
    state.exit_requested.store(true, Ordering::SeqCst);
}

fn handle_status(state: &AppState, stream: TcpStream) {
    let config = state.config.read();
    let temp = state.hal.read_temperature().unwrap_or(0);
    let uptime = state.start.elapsed().as_secs();
    let uptime_str = format_uptime(uptime);
    let body = format!(
        "{{\"chip\":\"{}\",\"sensor\":\"{}\",\"temp\":\"{:.1}\u{b0}C\",\"uptime\":\"{}\"}}",
        config.system.sensor_config, config.system.iq_config, temp as f64 / 1000.0, uptime_str
    );
    json_response(stream, body);
}

fn format_uptime(secs: u64) -> String {
    if secs > 86400 {
        format!("{} days, {}:{:02}:{:02}", secs / 86400, (secs % 86400) / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs > 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else {
        format!("{}:{:02}", secs / 60, secs % 60)
    }
}

fn handle_time(state: &AppState, request: &Request, stream: TcpStream) {
    if let Some(fmt) = request.query.get("fmt") {
        state.config.write().system.time_format = fmt.clone();
    }
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    let fmt = state.config.read().system.time_format.clone();
    let body = format!("{{\"fmt\":\"{fmt}\",\"ts\":{}}}", now.as_secs());
    json_response(stream, body);
}

fn handle_night(state: &AppState, request: &Request, stream: TcpStream) {
    if let Some(enable) = request.query.get("manual") {
        state.night.set_manual(parse_bool(enable));
    }
    if let Some(mode) = request.query.get("mode") {
        match mode.as_str() {
            "night" => state.night.force_mode(Mode::Night),
            "day" => state.night.force_mode(Mode::Day),
            _ => {}
        }
    }
    let mode = match state.night.current_mode() {
        Mode::Day => "day",
        Mode::Night => "night",
    };
    let body = format!("{{\"mode\":\"{mode}\"}}");
    json_response(stream, body);
}

fn handle_record(state: &AppState, request: &Request, stream: TcpStream) {
    if request.query.contains_key("start") {
        state.recorder.start();
    }
    if request.query.contains_key("stop") {
        state.recorder.stop();
    }
    let config = state.config.read();
    let body = format!(
        "{{\"recording\":{},\"continuous\":{},\"path\":\"{}\",\"filename\":\"{}\",\"segment_duration\":{},\"segment_size\":{}}}",
        state.recorder.is_running(),
        config.record.r#continuous,
        config.record.path,
        config.record.filename,
        config.record.segment_duration,
        config.record.segment_size
    );
    json_response(stream, body);
}

fn handle_cmd(state: &AppState, request: &Request, stream: TcpStream) {
    let mut result = -1i32;
    if request.query.contains_key("save") {
        let config = state.config.read();
        result = match config.save(&state.config_path) {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "failed to save configuration");
                -1
            }
        };
    }
    json_response(stream, format!("{{\"code\":{result}}}"));
}

fn handle_isp(state: &AppState, stream: TcpStream) {
    let luma = state.hal.read_isp_ave_luma().unwrap_or(-1);
    let exposure = state.hal.read_isp_exposure_info().ok();
    let (iso, exptime) = exposure.map(|e| (e.iso, e.exposure_time_us)).unwrap_or((0, 0));
    json_response(stream, format!("{{\"luma\":{luma},\"iso\":{iso},\"exposure_time_us\":{exptime}}}"));
}

fn handle_snapshot(state: &AppState, request: &Request, stream: TcpStream) {
    let config = state.config.read();
    let width = request.query.get("width").and_then(|v| v.parse().ok()).unwrap_or(config.jpeg.width);
    let height = request.query.get("height").and_then(|v| v.parse().ok()).unwrap_or(config.jpeg.height);
    let qfactor = request.query.get("qfactor").and_then(|v| v.parse().ok()).unwrap_or(config.jpeg.qfactor);
    drop(config);

    let mut stream = stream;
    match state.hal.snapshot(width, height, qfactor) {
        Ok(jpeg) => {
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                jpeg.len()
            );
            if stream.write_all(header.as_bytes()).is_ok() {
                let _ = stream.write_all(&jpeg);
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "snapshot failed");
            send_error(&mut stream, 500);
        }
    }
}

fn handle_osd(state: &AppState, request: &Request, stream: TcpStream, uri: &str) {
    let Some(id) = uri.strip_prefix("/api/osd/").and_then(|s| s.parse::<usize>().ok()) else {
        let mut stream = stream;
        send_error(&mut stream, 400);
        return;
    };
    if let Some(text) = request.query.get("text") {
        let mut region = state.config.read().osd.regions.get(id).cloned().unwrap_or_default();
        region.text = text.clone();
        state.osd.set_region(id, region);
    }
    json_response(stream, format!("{{\"region\":{id}}}"));
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "true" | "1")
}

fn stream_header(content_type: &str, chunked: bool) -> String {
    if chunked {
        format!("HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nTransfer-Encoding: chunked\r\nConnection: keep-alive\r\n\r\n")
    } else {
        format!("HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nConnection: keep-alive\r\n\r\n")
    }
}

fn register_stream(state: &AppState, mut stream: TcpStream, request: &Request, channel: usize, content_type: &str, kind: SinkKind) {
    let _ = request;
    let header = stream_header(content_type, true);
    if stream.write_all(header.as_bytes()).is_err() {
        return;
    }
    let row = ClientRow { channel, stream, kind, alive: true };
    if state.delivery.add(row).is_none() {
        tracing::warn!("delivery table full, dropping streaming client");
    }
}

fn register_h26x(state: &AppState, stream: TcpStream, request: &Request) {
    let codec = state.config.read().mp4.codec_h265.then_some(VideoCodec::H265).unwrap_or(VideoCodec::H264);
    register_stream(
        state,
        stream,
        request,
        0,
        "application/octet-stream",
        SinkKind::H26x { codec, nal_counter: 0, seen_param_set: false },
    );
}

/// Reconfigures MP4 muxing. Never opens a stream itself: `/video.mp4` is the
/// only URI that registers a streaming client.
fn handle_mp4(state: &AppState, request: &Request, stream: TcpStream) {
    let config = state.config.read();
    let enable = request.query.get("enable").map(|v| parse_bool(v)).unwrap_or(config.mp4.enable);
    let width = request.query.get("width").and_then(|v| v.parse().ok()).unwrap_or(config.mp4.width);
    let height = request.query.get("height").and_then(|v| v.parse().ok()).unwrap_or(config.mp4.height);
    let codec_h265 = request.query.get("codec").map(|v| v == "h265" || v == "265").unwrap_or(config.mp4.codec_h265);
    drop(config);

    if enable {
        state.media.enable_mp4(state, width, height, codec_h265);
    } else {
        state.media.disable_mp4(state);
    }

    let config = state.config.read();
    let body = format!("{{\"enable\":{},\"width\":{},\"height\":{},\"codec_h265\":{}}}", config.mp4.enable, config.mp4.width, config.mp4.height, config.mp4.codec_h265);
    json_response(stream, body);
}

/// Reconfigures the audio capture/encode path, or disables it. Tears down
/// and rebuilds the HAL audio path in place rather than only flipping a
/// flag, since sample rate/channel count changes require a fresh
/// `audio_init`.
fn handle_audio(state: &AppState, request: &Request, stream: TcpStream) {
    let config = state.config.read();
    let enable = request.query.get("enable").map(|v| parse_bool(v)).unwrap_or(config.audio.enable);
    let srate = request.query.get("srate").and_then(|v| v.parse().ok()).unwrap_or(config.audio.srate);
    let channels = request.query.get("channels").and_then(|v| v.parse().ok()).unwrap_or(config.audio.channels);
    let bitrate = request.query.get("bitrate").and_then(|v| v.parse().ok()).unwrap_or(config.audio.bitrate);
    let codec = request
        .query
        .get("codec")
        .map(|v| if v.eq_ignore_ascii_case("mp3") { CfgAudioCodec::Mp3 } else { CfgAudioCodec::Aac })
        .unwrap_or(config.audio.codec);
    drop(config);

    let mut result = 0i32;
    if enable {
        if let Err(e) = state.media.enable_audio(state, srate, channels, bitrate, codec) {
            tracing::warn!(error = %e, "failed to enable audio");
            result = -1;
        }
    } else if let Err(e) = state.media.disable_audio(state) {
        tracing::warn!(error = %e, "failed to disable audio");
        result = -1;
    }

    let config = state.config.read();
    let body = format!("{{\"code\":{result},\"enable\":{},\"srate\":{},\"channels\":{}}}", config.audio.enable, config.audio.srate, config.audio.channels);
    json_response(stream, body);
}

/// Reconfigures the MJPEG/still-JPEG snapshot source. Unlike `/mjpeg`, never
/// opens a streaming connection: it only mutates `JpegConfig` and restarts
/// the snapshot thread under it.
fn handle_mjpeg_reconfigure(state: &AppState, request: &Request, stream: TcpStream) {
    let config = state.config.read();
    let enable = request.query.get("enable").map(|v| parse_bool(v)).unwrap_or(config.jpeg.enable);
    let width = request.query.get("width").and_then(|v| v.parse().ok()).unwrap_or(config.jpeg.width);
    let height = request.query.get("height").and_then(|v| v.parse().ok()).unwrap_or(config.jpeg.height);
    let fps = request.query.get("fps").and_then(|v| v.parse().ok()).unwrap_or(config.jpeg.fps);
    let qfactor = request.query.get("qfactor").and_then(|v| v.parse().ok()).unwrap_or(config.jpeg.qfactor);
    drop(config);

    if enable {
        state.media.enable_mjpeg(state, width, height, fps, qfactor);
    } else {
        state.media.disable_mjpeg(state);
    }

    let config = state.config.read();
    let body = format!("{{\"enable\":{},\"width\":{},\"height\":{},\"fps\":{}}}", config.jpeg.enable, config.jpeg.width, config.jpeg.height, config.jpeg.fps);
    json_response(stream, body);
}

fn register_mp4(state: &AppState, stream: TcpStream, request: &Request) {
    let codec = state.config.read().mp4.codec_h265.then_some(VideoCodec::H265).unwrap_or(VideoCodec::H264);
    register_stream(
        state,
        stream,
        request,
        0,
        "video/mp4",
        SinkKind::Mp4 { state: Mp4ClientState::default(), codec, sent_init: false },
    );
}

fn register_mjpeg(state: &AppState, mut stream: TcpStream, request: &Request) {
    let _ = request;
    let header = "HTTP/1.0 200 OK\r\nCache-Control: no-cache\r\nPragma: no-cache\r\nConnection: close\r\n\
        Content-Type: multipart/x-mixed-replace; boundary=boundarydonotcross\r\n\r\n";
    if stream.write_all(header.as_bytes()).is_err() {
        return;
    }
    let row = ClientRow { channel: 0, stream, kind: SinkKind::Mjpeg, alive: true };
    if state.delivery.add(row).is_none() {
        tracing::warn!("delivery table full, dropping mjpeg client");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_accepted_boolean_spellings() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("nonsense"));
    }

    #[test]
    fn formats_uptime_buckets() {
        assert_eq!(format_uptime(90), "1:30");
        assert_eq!(format_uptime(3700), "1:01:40");
        assert_eq!(format_uptime(90000), "1 days, 1:00:00");
    }
}
