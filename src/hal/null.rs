//! Synthetic HAL backend: generates a test pattern and a 1kHz tone instead
//! of talking to real silicon — a source of known-shape media so the rest
//! of the system can be driven without hardware.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{HalError, HalErrorKind};
use crate::hal::{
    AudioFrameSink, ChannelId, ChannelParams, Hal, IspExposureInfo, OsdBitmap, OsdRect, PcmFrame,
    VideoCodec, VideoFrame, VideoFrameSink,
};

struct ChannelState {
    params: ChannelParams,
    bound: bool,
    grayscale: bool,
    request_idr: Arc<AtomicBool>,
}

pub struct NullHal {
    channels: Mutex<std::collections::HashMap<ChannelId, ChannelState>>,
    audio_running: AtomicBool,
    audio_stop: Mutex<Option<Arc<AtomicBool>>>,
    simulated_luma: AtomicI32,
}

impl NullHal {
    pub fn new() -> Self {
        NullHal {
            channels: Mutex::new(std::collections::HashMap::new()),
            audio_running: AtomicBool::new(false),
            audio_stop: Mutex::new(None),
            simulated_luma: AtomicI32::new(128),
        }
    }

    /// Test hook: push a synthetic ISP luma reading, used by nightmode tests
    /// to drive the ISP-luma sampling source without a real sensor.
    pub fn set_simulated_luma(&self, luma: i32) {
        self.simulated_luma.store(luma, Ordering::SeqCst);
    }

    fn synthetic_sps_pps(codec: VideoCodec) -> (Vec<u8>, Vec<u8>) {
        match codec {
            VideoCodec::H264 => (
                vec![0x67, 0x42, 0x00, 0x1f, 0x96, 0x54, 0x05, 0x01, 0xef, 0x78],
                vec![0x68, 0xce, 0x3c, 0x80],
            ),
            VideoCodec::H265 => (
                vec![0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0xb0],
                vec![0x44, 0x01, 0xc1, 0x72, 0xb4, 0x62, 0x40],
            ),
        }
    }
}

impl Default for NullHal {
    fn default() -> Self {
        Self::new()
    }
}

impl Hal for NullHal {
    fn identify(&self) -> &str {
        "null-hal (synthetic, no vendor SDK bound)"
    }

    fn pipeline_create(&self) -> Result<(), HalError> {
        Ok(())
    }

    fn pipeline_destroy(&self) -> Result<(), HalError> {
        Ok(())
    }

    fn channel_create(&self, channel: ChannelId, params: ChannelParams) -> Result<(), HalError> {
        self.channels.lock().insert(
            channel,
            ChannelState {
                params,
                bound: false,
                grayscale: false,
                request_idr: Arc::new(AtomicBool::new(true)),
            },
        );
        Ok(())
    }

    fn channel_bind(&self, channel: ChannelId) -> Result<(), HalError> {
        let mut guard = self.channels.lock();
        let state = guard
            .get_mut(&channel)
            .ok_or_else(|| HalError::vendor("channel_bind", -1, "no such channel"))?;
        state.bound = true;
        Ok(())
    }

    fn channel_unbind(&self, channel: ChannelId) -> Result<(), HalError> {
        if let Some(state) = self.channels.lock().get_mut(&channel) {
            state.bound = false;
        }
        Ok(())
    }

    fn channel_destroy(&self, channel: ChannelId) -> Result<(), HalError> {
        self.channels.lock().remove(&channel);
        Ok(())
    }

    fn channel_grayscale(&self, channel: ChannelId, enable: bool) -> Result<(), HalError> {
        if let Some(state) = self.channels.lock().get_mut(&channel) {
            state.grayscale = enable;
        }
        Ok(())
    }

    fn channel_request_idr(&self, channel: ChannelId) -> Result<(), HalError> {
        let guard = self.channels.lock();
        if let Some(state) = guard.get(&channel) {
            state.request_idr.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn audio_init(&self, _sample_rate: u32, _channels: u8) -> Result<(), HalError> {
        Ok(())
    }

    fn audio_deinit(&self) -> Result<(), HalError> {
        self.audio_running.store(false, Ordering::SeqCst);
        if let Some(flag) = self.audio_stop.lock().take() {
            flag.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn audio_capture_thread(&self, sink: Arc<dyn AudioFrameSink>) -> Result<(), HalError> {
        self.audio_running.store(true, Ordering::SeqCst);
        let flag = Arc::new(AtomicBool::new(true));
        let flag_thread = flag.clone();
        *self.audio_stop.lock() = Some(flag);

        // The real vendor capture loop blocks on this thread forever; we
        // simulate that by generating 20ms PCM frames at a fixed cadence on
        // a dedicated thread.
        thread::Builder::new()
            .name("hal-null-audio".into())
            .spawn(move || {
                let mut phase = 0.0f64;
                let sample_rate = 16000u32;
                let frame_samples = (sample_rate / 50) as usize; // 20ms
                let mut pts_us: u64 = 0;
                while flag_thread.load(Ordering::SeqCst) {
                    let mut samples = Vec::with_capacity(frame_samples);
                    let phase_inc = 2.0 * std::f64::consts::PI * 1000.0 / sample_rate as f64;
                    for _ in 0..frame_samples {
                        samples.push((phase.sin() * 0.05 * 32767.0) as i16);
                        phase += phase_inc;
                        if phase > 2.0 * std::f64::consts::PI {
                            phase -= 2.0 * std::f64::consts::PI;
                        }
                    }
                    sink.on_pcm_frame(PcmFrame {
                        channel: 0,
                        samples,
                        sample_rate,
                        channels: 1,
                        pts_us,
                    });
                    pts_us += 20_000;
                    thread::sleep(Duration::from_millis(20));
                }
            })
            .map_err(|e| HalError::vendor("audio_capture_thread", -1, e.to_string()))?;

        Ok(())
    }

    fn video_capture_thread(
        &self,
        channel: ChannelId,
        sink: Arc<dyn VideoFrameSink>,
    ) -> Result<(), HalError> {
        let codec = self
            .channels
            .lock()
            .get(&channel)
            .map(|s| s.params.codec)
            .ok_or_else(|| HalError::vendor("video_capture_thread", -1, "no such channel"))?;
        let fps = self.channels.lock().get(&channel).map(|s| s.params.fps).unwrap_or(25).max(1);
        let gop = self.channels.lock().get(&channel).map(|s| s.params.gop).unwrap_or(fps);

        thread::Builder::new()
            .name(format!("hal-null-video-{channel}"))
            .spawn(move || {
                let (sps, pps) = Self::synthetic_sps_pps(codec);
                let frame_interval = Duration::from_millis(1000 / fps as u64);
                let start = Instant::now();
                let mut n: u64 = 0;
                loop {
                    let is_keyframe = n % gop as u64 == 0;
                    let mut nalus = Vec::new();
                    if is_keyframe {
                        nalus.push(sps.clone());
                        nalus.push(pps.clone());
                        nalus.push(vec![0x65, 0x88, 0x84, 0x00]); // synthetic IDR slice
                    } else {
                        nalus.push(vec![0x41, 0x9a, 0x24, 0x00]); // synthetic P slice
                    }
                    sink.on_video_frame(VideoFrame {
                        channel,
                        codec,
                        is_keyframe,
                        nalus,
                        pts_us: start.elapsed().as_micros() as u64,
                    });
                    n += 1;
                    thread::sleep(frame_interval);
                }
            })
            .map_err(|e| HalError::vendor("video_capture_thread", -1, e.to_string()))?;

        Ok(())
    }

    fn region_create(&self, _region: u32, _rect: OsdRect, _fg_alpha: u8, _bg_alpha: u8) -> Result<(), HalError> {
        Ok(())
    }

    fn region_set_bitmap(&self, _region: u32, _bitmap: &OsdBitmap) -> Result<(), HalError> {
        Ok(())
    }

    fn region_destroy(&self, _region: u32) -> Result<(), HalError> {
        Ok(())
    }

    fn snapshot(&self, width: u32, height: u32, _qfactor: u32) -> Result<Vec<u8>, HalError> {
        Err(HalError {
            op: "snapshot",
            kind: HalErrorKind::NotSupported,
            code: 0,
            message: format!("null HAL has no JPEG encoder for {width}x{height}"),
        })
    }

    fn read_temperature(&self) -> Result<i32, HalError> {
        Ok(45_000)
    }

    fn read_isp_exposure_info(&self) -> Result<IspExposureInfo, HalError> {
        Ok(IspExposureInfo { iso: 100, exposure_time_us: 10_000, gain: 0 })
    }

    fn read_isp_ave_luma(&self) -> Result<i32, HalError> {
        Ok(self.simulated_luma.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_lifecycle() {
        let hal = NullHal::new();
        let params = ChannelParams {
            width: 1920,
            height: 1080,
            fps: 25,
            gop: 50,
            bitrate_kbps: 4096,
            codec: VideoCodec::H264,
        };
        hal.channel_create(0, params).unwrap();
        hal.channel_bind(0).unwrap();
        hal.channel_grayscale(0, true).unwrap();
        hal.channel_unbind(0).unwrap();
        hal.channel_destroy(0).unwrap();
        assert!(hal.channel_bind(0).is_err());
    }

    #[test]
    fn simulated_luma_round_trips() {
        let hal = NullHal::new();
        hal.set_simulated_luma(12);
        assert_eq!(hal.read_isp_ave_luma().unwrap(), 12);
    }

    #[test]
    fn snapshot_not_supported() {
        let hal = NullHal::new();
        let err = hal.snapshot(640, 360, 80).unwrap_err();
        assert_eq!(err.kind, HalErrorKind::NotSupported);
    }
}
