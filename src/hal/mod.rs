//! Hardware abstraction layer: the seam between the media orchestrator core
//! and a vendor SoC SDK.
//!
//! No vendor SDK is available to bind against in this workspace, so the only
//! backend shipped here is [`null`], a synthetic implementation that drives
//! the same callback contract with generated frames, exercising the rest of
//! the system without real hardware.

pub mod null;

use std::sync::Arc;

use crate::error::HalError;

pub type ChannelId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

/// One encoded video frame handed up from the vendor video encoder.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub channel: ChannelId,
    pub codec: VideoCodec,
    pub is_keyframe: bool,
    /// Annex-B NAL units, start-code stripped, one entry per NAL.
    pub nalus: Vec<Vec<u8>>,
    pub pts_us: u64,
}

/// One encoded audio frame handed up from the HAL's PCM capture path.
///
/// The HAL only ever hands up raw PCM; encoding to MP3/AAC happens in
/// `audio::` above this layer.
#[derive(Debug, Clone)]
pub struct PcmFrame {
    pub channel: ChannelId,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u8,
    pub pts_us: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub gop: u32,
    pub bitrate_kbps: u32,
    pub codec: VideoCodec,
}

#[derive(Debug, Clone, Copy)]
pub struct IspExposureInfo {
    pub iso: i32,
    pub exposure_time_us: i32,
    pub gain: i32,
}

/// Bitmap handed to `region_set_bitmap`, already rendered to the platform's
/// native OSD pixel format (ARGB1555) by `osd::render`.
#[derive(Debug, Clone)]
pub struct OsdBitmap {
    pub width: u32,
    pub height: u32,
    /// ARGB1555, row-major, no padding.
    pub pixels: Vec<u16>,
}

#[derive(Debug, Clone, Copy)]
pub struct OsdRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Classifies `nal` as a parameter set (SPS/PPS/VPS) rather than a slice —
/// the same split [`crate::mp4::Mp4Muxer`] uses to decide which NALs belong
/// in the decoder config, reused here so HTTP/RTSP delivery know which NAL
/// a freshly registered client may start receiving from.
pub fn is_parameter_set(codec: VideoCodec, nal: &[u8]) -> bool {
    if nal.is_empty() {
        return false;
    }
    match codec {
        VideoCodec::H264 => matches!(nal[0] & 0x1f, 7 | 8),
        VideoCodec::H265 => matches!((nal[0] >> 1) & 0x3f, 32 | 33 | 34),
    }
}

pub trait VideoFrameSink: Send + Sync {
    fn on_video_frame(&self, frame: VideoFrame);
}

pub trait AudioFrameSink: Send + Sync {
    fn on_pcm_frame(&self, frame: PcmFrame);
}

/// The vendor SDK boundary. Every method may fail with an opaque
/// [`HalError`]; the core never interprets the vendor code, only logs and
/// reacts per the error kind.
pub trait Hal: Send + Sync {
    fn identify(&self) -> &str;

    fn pipeline_create(&self) -> Result<(), HalError>;
    fn pipeline_destroy(&self) -> Result<(), HalError>;

    fn channel_create(&self, channel: ChannelId, params: ChannelParams) -> Result<(), HalError>;
    fn channel_bind(&self, channel: ChannelId) -> Result<(), HalError>;
    fn channel_unbind(&self, channel: ChannelId) -> Result<(), HalError>;
    fn channel_destroy(&self, channel: ChannelId) -> Result<(), HalError>;
    fn channel_grayscale(&self, channel: ChannelId, enable: bool) -> Result<(), HalError>;
    fn channel_request_idr(&self, channel: ChannelId) -> Result<(), HalError>;

    fn audio_init(&self, sample_rate: u32, channels: u8) -> Result<(), HalError>;
    fn audio_deinit(&self) -> Result<(), HalError>;

    /// Starts the vendor's blocking audio capture loop on a thread owned by
    /// the HAL implementation, delivering frames to `sink` until
    /// `audio_deinit` is called.
    fn audio_capture_thread(&self, sink: Arc<dyn AudioFrameSink>) -> Result<(), HalError>;

    /// Starts the vendor's blocking video capture loop on a thread owned by
    /// the HAL implementation, delivering frames to `sink` for `channel`
    /// until `channel_unbind` is called.
    fn video_capture_thread(
        &self,
        channel: ChannelId,
        sink: Arc<dyn VideoFrameSink>,
    ) -> Result<(), HalError>;

    fn region_create(&self, region: u32, rect: OsdRect, fg_alpha: u8, bg_alpha: u8) -> Result<(), HalError>;
    fn region_set_bitmap(&self, region: u32, bitmap: &OsdBitmap) -> Result<(), HalError>;
    fn region_destroy(&self, region: u32) -> Result<(), HalError>;

    /// Captures a still JPEG at the given dimensions/quality. `Err` with
    /// `HalErrorKind::NotSupported` means the caller should fall back to the
    /// last cached MJPEG frame instead.
    fn snapshot(&self, width: u32, height: u32, qfactor: u32) -> Result<Vec<u8>, HalError>;

    /// Chip temperature in millidegrees Celsius, if the platform exposes one.
    fn read_temperature(&self) -> Result<i32, HalError>;
    fn read_isp_exposure_info(&self) -> Result<IspExposureInfo, HalError>;
    fn read_isp_ave_luma(&self) -> Result<i32, HalError>;
}
