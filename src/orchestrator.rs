//! Media orchestrator: wires the HAL capture callbacks into every delivery
//! path (HTTP fan-out, RTSP, UDP, fragmented MP4, recorder) and owns the
//! startup/shutdown sequence for the whole process.
//!
//! Grounded on a calling stack's per-session media wiring — there, one
//! call's RTP/SRTP pipeline fans decoded frames out to the network and a
//! recorder bot; here the same shape fans an `Arc<dyn Hal>`'s capture
//! threads out to four sinks instead of one.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::audio::speex::SpeexPreprocessor;
use crate::audio::{self, AudioEncoder};
use crate::channel::ChannelRegistry;
use crate::config::{AppConfig, AudioCodec};
use crate::delivery::DeliveryTable;
use crate::hal::{
    is_parameter_set, AudioFrameSink, ChannelId, ChannelParams, Hal, PcmFrame, VideoCodec,
    VideoFrame, VideoFrameSink,
};
use crate::http::{self, AppState};
use crate::mp4::Mp4Muxer;
use crate::nightmode::NightController;
use crate::osd::OsdCompositor;
use crate::pidfile::{self, PidFile};
use crate::record::Recorder;
use crate::rtsp::RtspServer;
use crate::udp_stream::{self, UdpStreamer};
use crate::watchdog::Watchdog;

type VideoGroup = (Vec<Vec<u8>>, bool, u32);

/// Fans one decoded video access unit out to every configured sink. Runs on
/// the HAL's own capture thread; every branch here must be non-blocking or
/// bounded, since the vendor capture loop waits on this call to return
/// before it can deliver the next frame.
struct VideoPipeline {
    channel: ChannelId,
    delivery: Arc<DeliveryTable>,
    udp: Option<Arc<UdpStreamer>>,
    rtsp: Option<Arc<RtspServer>>,
    mp4_enabled: Arc<AtomicBool>,
    mp4_muxer: Arc<Mutex<Mp4Muxer>>,
    duration_90k: u32,
    group_tx: Sender<VideoGroup>,
}

impl VideoFrameSink for VideoPipeline {
    fn on_video_frame(&self, frame: VideoFrame) {
        self.delivery.send_h26x(self.channel as usize, &frame.nalus);

        if let Some(udp) = &self.udp {
            for nal in &frame.nalus {
                udp.send_nal(frame.codec, nal, frame.is_keyframe);
            }
        }

        if let Some(rtsp) = &self.rtsp {
            let last = frame.nalus.len().saturating_sub(1);
            for (i, nal) in frame.nalus.iter().enumerate() {
                let is_param = is_parameter_set(frame.codec, nal);
                rtsp.push_video(self.channel, nal, frame.is_keyframe, is_param, frame.pts_us, i == last);
            }
        }

        if !self.mp4_enabled.load(Ordering::Relaxed) {
            return;
        }

        let finished = {
            let mut mux = self.mp4_muxer.lock();
            mux.ingest_video(frame.nalus, frame.is_keyframe, self.duration_90k)
        };
        match finished {
            Ok(Some((nalus, is_keyframe))) => {
                let for_recorder = nalus.clone();
                let muxer_init = self.mp4_muxer.clone();
                let muxer_frag = self.mp4_muxer.clone();
                let duration_90k = self.duration_90k;
                self.delivery.send_mp4(
                    self.channel as usize,
                    move || muxer_init.lock().get_init_segment().unwrap_or_default(),
                    move |client, _codec| {
                        let mux = muxer_frag.lock();
                        let moof = mux.get_moof(client, &nalus, is_keyframe, duration_90k);
                        let mdat = mux.get_mdat(client, &nalus);
                        (moof, mdat)
                    },
                );
                if self.group_tx.try_send((for_recorder, is_keyframe, duration_90k)).is_err() {
                    tracing::warn!("recorder queue full, dropping video group");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "mp4 ingest failed"),
        }
    }
}

/// Buffers PCM into the encoder's native frame size, runs the optional
/// SpeexDSP preprocessing chain, and fans encoded frames out to the HTTP PCM
/// sink and RTSP audio track. Runs on the HAL's audio capture thread.
struct AudioPipeline {
    channel: ChannelId,
    codec: AudioCodec,
    sample_rate: u32,
    delivery: Arc<DeliveryTable>,
    rtsp: Option<Arc<RtspServer>>,
    mute: AtomicBool,
    samples_emitted: AtomicU64,
    state: Mutex<AudioPipelineState>,
}

struct AudioPipelineState {
    buffer: Vec<i16>,
    encoder: Box<dyn AudioEncoder>,
    speex: Option<SpeexPreprocessor>,
}

impl AudioFrameSink for AudioPipeline {
    fn on_pcm_frame(&self, frame: PcmFrame) {
        let mut samples = frame.samples;
        audio::apply_mute(&mut samples, self.mute.load(Ordering::Relaxed));

        let mut state = self.state.lock();
        if let Some(speex) = &mut state.speex {
            speex.process(&mut samples);
        }
        state.buffer.extend_from_slice(&samples);

        let input_samples = state.encoder.input_samples();
        while state.buffer.len() >= input_samples {
            let chunk: Vec<i16> = state.buffer.drain(..input_samples).collect();
            let emitted = self.samples_emitted.fetch_add(input_samples as u64, Ordering::Relaxed);
            let pts_us = emitted * 1_000_000 / self.sample_rate as u64;
            match state.encoder.encode(&chunk, pts_us) {
                Ok(encoded) => {
                    self.delivery.send_pcm(self.channel as usize, &encoded.payload);
                    if let Some(rtsp) = &self.rtsp {
                        match self.codec {
                            AudioCodec::Mp3 => rtsp.push_mp3(self.channel, &encoded.payload, self.sample_rate),
                            AudioCodec::Aac => {
                                rtsp.push_aac(self.channel, &encoded.payload, input_samples as u32, self.sample_rate)
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "audio encode failed"),
            }
        }
    }
}

/// Shared reconfiguration surface for the `/api/mp4`, `/api/audio` and
/// `/api/mjpeg`/`/api/jpeg` routes. Holds everything needed to tear down and
/// rebuild one media path without touching the others, the same per-path
/// independence `VideoPipeline`/`AudioPipeline` already give the steady
/// state.
pub struct MediaControl {
    hal: Arc<dyn Hal>,
    delivery: Arc<DeliveryTable>,
    channel: ChannelId,
    rtsp: Option<Arc<RtspServer>>,
    mp4_muxer: Arc<Mutex<Mp4Muxer>>,
    mp4_enabled: Arc<AtomicBool>,
    jpeg: parking_lot::Mutex<Option<Arc<AtomicBool>>>,
}

impl MediaControl {
    /// Re-points the shared MP4 muxer at a new configuration and flips the
    /// shared enable flag `VideoPipeline` reads on every frame. No HAL call
    /// is needed: MP4 is a packaging layer over the channel's existing
    /// encode output, not a separate capture path.
    pub fn enable_mp4(&self, state: &AppState, width: u32, height: u32, codec_h265: bool) {
        let video_codec = if codec_h265 { VideoCodec::H265 } else { VideoCodec::H264 };
        let audio = {
            let config = state.config.read();
            config.audio.enable.then_some((config.audio.codec, config.audio.bitrate, config.audio.channels, config.audio.srate))
        };
        let mut muxer = Mp4Muxer::new(width, height, video_codec);
        if let Some((codec, bitrate, channels, srate)) = audio {
            muxer.set_config(width, height, Some(codec), bitrate, channels, srate);
        }
        *self.mp4_muxer.lock() = muxer;
        self.mp4_enabled.store(true, Ordering::Relaxed);

        let mut config = state.config.write();
        config.mp4.enable = true;
        config.mp4.width = width;
        config.mp4.height = height;
        config.mp4.codec_h265 = codec_h265;
    }

    pub fn disable_mp4(&self, state: &AppState) {
        self.mp4_enabled.store(false, Ordering::Relaxed);
        state.config.write().mp4.enable = false;
    }

    /// Tears down and re-initializes the HAL audio path, rebuilding the
    /// encoder/preprocessor chain from scratch the same way [`Orchestrator::start`]
    /// does on first boot.
    pub fn enable_audio(&self, state: &AppState, srate: u32, channels: u8, bitrate: u32, codec: AudioCodec) -> Result<()> {
        let _ = self.hal.audio_deinit();
        self.hal.audio_init(srate, channels).context("hal audio_init failed")?;

        let (aac_quantqual, aac_bandwidth, aac_tns, speex_enable, speex_frame_size) = {
            let config = state.config.read();
            (
                config.audio.aac_quantqual,
                config.audio.aac_bandwidth,
                config.audio.aac_tns,
                config.audio.speex_enable,
                config.audio.speex_frame_size,
            )
        };
        let encoder = audio::build_encoder(codec, srate, channels, bitrate, aac_quantqual, aac_bandwidth, aac_tns)
            .context("failed to build audio encoder")?;
        let speex = speex_enable.then(|| {
            let frame_size = if speex_frame_size > 0 { speex_frame_size as usize } else { encoder.input_samples() };
            SpeexPreprocessor::new(frame_size, srate, &state.config.read().audio)
        });

        let sink = Arc::new(AudioPipeline {
            channel: self.channel,
            codec,
            sample_rate: srate,
            delivery: self.delivery.clone(),
            rtsp: self.rtsp.clone(),
            mute: AtomicBool::new(state.config.read().audio.mute),
            samples_emitted: AtomicU64::new(0),
            state: Mutex::new(AudioPipelineState { buffer: Vec::new(), encoder, speex }),
        });
        self.hal.audio_capture_thread(sink).context("hal audio_capture_thread failed")?;

        let (mp4_width, mp4_height) = {
            let config = state.config.read();
            (config.mp4.width, config.mp4.height)
        };
        self.mp4_muxer.lock().set_config(mp4_width, mp4_height, Some(codec), bitrate, channels, srate);

        let mut config = state.config.write();
        config.audio.enable = true;
        config.audio.srate = srate;
        config.audio.channels = channels;
        config.audio.bitrate = bitrate;
        config.audio.codec = codec;
        Ok(())
    }

    pub fn disable_audio(&self, state: &AppState) -> Result<()> {
        self.hal.audio_deinit().context("hal audio_deinit failed")?;
        state.config.write().audio.enable = false;
        Ok(())
    }

    /// Stops the running snapshot thread (if any) and spawns a fresh one
    /// under a new stop flag, so a config change takes effect without
    /// leaking the old thread.
    pub fn enable_mjpeg(&self, state: &AppState, width: u32, height: u32, fps: u32, qfactor: u32) {
        self.stop_jpeg_locked();
        let running = Arc::new(AtomicBool::new(true));
        *self.jpeg.lock() = Some(running.clone());
        let jpeg_cfg = crate::config::JpegConfig { enable: true, width, height, fps, qfactor, ..state.config.read().jpeg.clone() };
        spawn_snapshot_thread(self.hal.clone(), self.delivery.clone(), self.channel, jpeg_cfg.clone(), running);

        let mut config = state.config.write();
        config.jpeg = jpeg_cfg;
    }

    pub fn disable_mjpeg(&self, state: &AppState) {
        self.stop_jpeg_locked();
        state.config.write().jpeg.enable = false;
    }

    fn stop_jpeg_locked(&self) {
        if let Some(flag) = self.jpeg.lock().take() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Owns every long-lived subsystem and the order they start up and tear
/// down in. `state` carries exactly the fields the control API also needs
/// (config, hal, delivery, night, osd, recorder, media), so `http::routes`
/// and this module stay consistent without a second copy of that
/// bookkeeping.
pub struct Orchestrator {
    state: Arc<AppState>,
    channel: ChannelId,
    mp4_muxer: Arc<Mutex<Mp4Muxer>>,
    rtsp: Option<Arc<RtspServer>>,
    udp: Option<Arc<UdpStreamer>>,
    post_sender: Option<Arc<crate::http::post::PostSender>>,
    watchdog: Option<Watchdog>,
    _pidfile: PidFile,
    recorder_done_rx: Option<Receiver<()>>,
    keep_running: Arc<AtomicBool>,
    graceful: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Runs the full startup sequence: acquires the single-instance lock,
    /// probes the HAL, brings up the control API and streaming servers,
    /// then starts the HAL pipeline and every worker thread that depends on
    /// it. Fails stop on the first error, matching the original firmware's
    /// all-or-nothing boot.
    pub fn start(config: AppConfig, config_path: PathBuf, hal: Arc<dyn Hal>) -> Result<Self> {
        let pidfile = pidfile::acquire("camerad").context("another instance is already running")?;
        tracing::info!(path = %pidfile.path().display(), "acquired single-instance lock");

        tracing::info!(hal = hal.identify(), "hal identified");

        let watchdog = (config.system.watchdog > 0)
            .then(|| Watchdog::start(config.system.watchdog as i32))
            .flatten();

        if config.mdns.enable {
            tracing::warn!("mDNS announcement is configured but not implemented in this build");
        }

        let channels = Arc::new(ChannelRegistry::new(16));
        let delivery = Arc::new(DeliveryTable::new());
        let night = Arc::new(NightController::new(hal.clone(), 0, config.night_mode.clone()));
        let osd = Arc::new(OsdCompositor::new(hal.clone(), &config.osd, config.system.time_format.clone(), Vec::new()));
        let recorder = Arc::new(Recorder::new(config.record.clone()));

        let video_codec = if config.mp4.codec_h265 { VideoCodec::H265 } else { VideoCodec::H264 };
        let audio_sdp = config.audio.enable.then_some((config.audio.codec, config.audio.srate, config.audio.channels));

        // Channel and MP4-muxer construction are pure software, with no HAL
        // call, so both happen here ahead of `AppState` — `MediaControl`
        // needs them to exist before the control API can dispatch reroutes.
        let channel = channels
            .take_next_free(video_codec)
            .context("channel registry exhausted")? as ChannelId;
        let mp4_muxer = Arc::new(Mutex::new(Mp4Muxer::new(config.mp4.width, config.mp4.height, video_codec)));
        if config.audio.enable {
            mp4_muxer.lock().set_config(
                config.mp4.width,
                config.mp4.height,
                Some(config.audio.codec),
                config.audio.bitrate,
                config.audio.channels,
                config.audio.srate,
            );
        }
        let mp4_enabled = Arc::new(AtomicBool::new(config.mp4.enable));

        let rtsp = if config.rtsp.enable {
            let server = RtspServer::new(
                video_codec,
                audio_sdp,
                0,
                format!("{}:{}", config.rtsp.bind, config.rtsp.port),
                hal.clone(),
            );
            server.spawn(&config.rtsp).context("failed to start rtsp server")?;
            tracing::info!(port = config.rtsp.port, "rtsp server listening");
            Some(server)
        } else {
            None
        };

        let media = Arc::new(MediaControl {
            hal: hal.clone(),
            delivery: delivery.clone(),
            channel,
            rtsp: rtsp.clone(),
            mp4_muxer: mp4_muxer.clone(),
            mp4_enabled: mp4_enabled.clone(),
            jpeg: parking_lot::Mutex::new(None),
        });

        let state = Arc::new(AppState {
            config: parking_lot::RwLock::new(config.clone()),
            hal: hal.clone(),
            delivery: delivery.clone(),
            night: night.clone(),
            osd: osd.clone(),
            recorder: recorder.clone(),
            media: media.clone(),
            start: std::time::Instant::now(),
            exit_requested: AtomicBool::new(false),
            config_path,
        });

        http::HttpServer::new(state.clone())
            .spawn(&config.system.web_bind, config.system.web_port)
            .context("failed to start control API")?;
        tracing::info!(bind = %config.system.web_bind, port = config.system.web_port, "control api listening");

        let udp = if config.stream.enable {
            let destinations: Vec<SocketAddr> =
                config.stream.dests.iter().filter_map(|d| udp_stream::parse_destination(d)).collect();
            let streamer = UdpStreamer::new(config.stream.udp_srcport, destinations)
                .context("failed to bind udp streamer socket")?;
            tracing::info!(destinations = config.stream.dests.len(), "udp streaming enabled");
            Some(Arc::new(streamer))
        } else {
            None
        };

        hal.pipeline_create().context("hal pipeline_create failed")?;

        if config.audio.enable {
            hal.audio_init(config.audio.srate, config.audio.channels).context("hal audio_init failed")?;
        }

        let params = ChannelParams {
            width: config.mp4.width,
            height: config.mp4.height,
            fps: config.mp4.fps,
            gop: config.mp4.gop,
            bitrate_kbps: config.mp4.bitrate,
            codec: video_codec,
        };
        hal.channel_create(channel, params).context("hal channel_create failed")?;
        hal.channel_bind(channel).context("hal channel_bind failed")?;

        let (group_tx, group_rx) = crossbeam_channel::bounded::<VideoGroup>(64);
        let duration_90k = (90_000 / config.mp4.fps.max(1)) as u32;

        // The video capture thread always runs: raw H26x/RTSP/UDP delivery
        // don't depend on MP4 being enabled, only the mp4/recorder branch
        // inside `VideoPipeline::on_video_frame` is gated on it.
        let video_sink = Arc::new(VideoPipeline {
            channel,
            delivery: delivery.clone(),
            udp: udp.clone(),
            rtsp: rtsp.clone(),
            mp4_enabled,
            mp4_muxer: mp4_muxer.clone(),
            duration_90k,
            group_tx,
        });
        hal.video_capture_thread(channel, video_sink).context("hal video_capture_thread failed")?;

        if config.audio.enable {
            let encoder = audio::build_encoder(
                config.audio.codec,
                config.audio.srate,
                config.audio.channels,
                config.audio.bitrate,
                config.audio.aac_quantqual,
                config.audio.aac_bandwidth,
                config.audio.aac_tns,
            )
            .context("failed to build audio encoder")?;
            let speex = config.audio.speex_enable.then(|| {
                let frame_size = if config.audio.speex_frame_size > 0 {
                    config.audio.speex_frame_size as usize
                } else {
                    encoder.input_samples()
                };
                SpeexPreprocessor::new(frame_size, config.audio.srate, &config.audio)
            });
            let sink = Arc::new(AudioPipeline {
                channel,
                codec: config.audio.codec,
                sample_rate: config.audio.srate,
                delivery: delivery.clone(),
                rtsp: rtsp.clone(),
                mute: AtomicBool::new(config.audio.mute),
                samples_emitted: AtomicU64::new(0),
                state: Mutex::new(AudioPipelineState { buffer: Vec::new(), encoder, speex }),
            });
            hal.audio_capture_thread(sink).context("hal audio_capture_thread failed")?;
        }

        if config.jpeg.enable {
            let running = Arc::new(AtomicBool::new(true));
            *media.jpeg.lock() = Some(running.clone());
            spawn_snapshot_thread(hal.clone(), delivery.clone(), channel, config.jpeg.clone(), running);
        }

        if config.night_mode.enable {
            night.clone().spawn();
            tracing::info!("night mode controller started");
        }

        let post_sender = if config.http_post.enable {
            let sender = Arc::new(crate::http::post::PostSender::new(hal.clone(), config.http_post.clone()));
            sender.clone().spawn();
            tracing::info!(host = %config.http_post.host, "http post snapshot pusher started");
            Some(sender)
        } else {
            None
        };

        if config.osd.enable {
            osd.clone().spawn();
            tracing::info!("osd compositor started");
        }

        let recorder_done_rx = if config.record.enable && config.record.r#continuous {
            recorder.start();
            let muxer = mp4_muxer.clone();
            let recorder_thread = recorder.clone();
            let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
            std::thread::Builder::new()
                .name("recorder".into())
                .spawn(move || {
                    recorder_thread.run(&muxer, move || group_rx.recv().ok());
                    let _ = done_tx.send(());
                })
                .context("failed to spawn recorder thread")?;
            tracing::info!("continuous recording started");
            Some(done_rx)
        } else {
            None
        };

        Ok(Orchestrator {
            state,
            channel,
            mp4_muxer,
            rtsp,
            udp,
            post_sender,
            watchdog,
            _pidfile: pidfile,
            recorder_done_rx,
            keep_running: Arc::new(AtomicBool::new(true)),
            graceful: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Shared flag a signal handler flips to unwind [`Self::run`]'s main
    /// loop. `graceful` distinguishes SIGINT/SIGQUIT/SIGTERM from the
    /// fail-fast signals, which should skip straight to process exit instead
    /// of running teardown.
    pub fn signal_flags(&self) -> (Arc<AtomicBool>, Arc<AtomicBool>) {
        (self.keep_running.clone(), self.graceful.clone())
    }

    /// Blocks on the main loop: kick the watchdog once a second until a
    /// signal handler clears `keep_running`, then tear everything down in
    /// reverse startup order.
    pub fn run(&self) {
        while self.keep_running.load(Ordering::SeqCst) && !self.state.exit_requested.load(Ordering::SeqCst) {
            if let Some(wd) = &self.watchdog {
                wd.reset();
            }
            std::thread::sleep(Duration::from_secs(1));
        }

        if !self.graceful.load(Ordering::SeqCst) {
            tracing::warn!("fail-fast signal received, skipping teardown");
            return;
        }

        self.shutdown();
    }

    fn shutdown(&self) {
        tracing::info!("shutting down");

        self.state.recorder.stop();
        if let Some(rx) = &self.recorder_done_rx {
            let _ = rx.recv_timeout(Duration::from_secs(5));
        }

        self.state.osd.stop();
        self.state.night.stop();

        if let Some(post) = &self.post_sender {
            post.stop();
        }

        let _ = self.state.hal.channel_unbind(self.channel);
        let _ = self.state.hal.channel_destroy(self.channel);
        let _ = self.state.hal.audio_deinit();
        let _ = self.state.hal.pipeline_destroy();

        // Neither the RTSP accept loop nor the UDP socket has a stop
        // primitive; both threads (and the process) end when `run` returns.
        tracing::info!("shutdown complete");
    }
}

fn spawn_snapshot_thread(
    hal: Arc<dyn Hal>,
    delivery: Arc<DeliveryTable>,
    channel: ChannelId,
    jpeg: crate::config::JpegConfig,
    running: Arc<AtomicBool>,
) {
    std::thread::Builder::new()
        .name("jpeg-snapshot".into())
        .spawn(move || {
            let interval = Duration::from_millis(1000 / jpeg.fps.max(1) as u64);
            while running.load(Ordering::SeqCst) {
                match hal.snapshot(jpeg.width, jpeg.height, jpeg.qfactor) {
                    Ok(bytes) => delivery.send_mjpeg(channel as usize, &bytes),
                    Err(e) => tracing::debug!(error = %e, "snapshot unavailable"),
                }
                std::thread::sleep(interval);
            }
        })
        .expect("spawn jpeg-snapshot thread");
}
