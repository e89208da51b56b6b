//! Configuration loading, saving, and self-repair.
//!
//! YAML on disk (`/etc/camerad.yaml` by default), `serde_yaml2` for parsing.
//! Saves are atomic (write to a temp file in the same directory, `fsync`,
//! `rename`), and `time_format` is sanitized to printable ASCII on load with
//! self-repair if it's corrupt.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/camerad.yaml";
pub const DEFAULT_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

fn default_time_format() -> String {
    DEFAULT_TIME_FORMAT.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SystemConfig {
    pub sensor_config: String,
    pub iq_config: String,
    pub web_port: u16,
    pub web_bind: String,
    pub web_whitelist: Vec<String>,
    pub web_enable_auth: bool,
    pub web_auth_user: String,
    pub web_auth_pass: String,
    pub web_auth_skiplocal: bool,
    pub web_enable_static: bool,
    pub isp_thread_stack_size: u32,
    pub venc_stream_thread_stack_size: u32,
    pub web_server_thread_stack_size: u32,
    pub night_thread_stack_size: u32,
    #[serde(default = "default_time_format")]
    pub time_format: String,
    /// Watchdog timeout in seconds; 0 disables.
    pub watchdog: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            sensor_config: String::new(),
            iq_config: String::new(),
            web_port: 80,
            web_bind: "0.0.0.0".to_string(),
            web_whitelist: Vec::new(),
            web_enable_auth: false,
            web_auth_user: String::new(),
            web_auth_pass: String::new(),
            web_auth_skiplocal: true,
            web_enable_static: true,
            isp_thread_stack_size: 32 * 1024,
            venc_stream_thread_stack_size: 32 * 1024,
            web_server_thread_stack_size: 32 * 1024,
            night_thread_stack_size: 16 * 1024,
            time_format: default_time_format(),
            watchdog: 0,
        }
    }
}

/// GPIO pin configuration. `999` and any negative value both mean
/// "disabled", the legacy sentinel encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinCfg(pub i32);

impl PinCfg {
    pub fn resolve(self) -> Option<u32> {
        if self.0 == 999 || self.0 < 0 {
            None
        } else {
            Some(self.0 as u32)
        }
    }
}

impl Serialize for PinCfg {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i32(self.0)
    }
}

impl<'de> Deserialize<'de> for PinCfg {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(PinCfg(i32::deserialize(d)?))
    }
}

impl Default for PinCfg {
    fn default() -> Self {
        PinCfg(999)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NightModeConfig {
    pub enable: bool,
    pub manual: bool,
    pub grayscale: bool,
    pub ir_sensor_pin: PinCfg,
    pub check_interval_s: u32,
    pub ir_cut_pin1: PinCfg,
    pub ir_cut_pin2: PinCfg,
    pub ir_led_pin: PinCfg,
    pub white_led_pin: PinCfg,
    pub pin_switch_delay_us: u32,
    pub adc_device: String,
    pub adc_threshold: i32,
    pub isp_lum_low: i32,
    pub isp_lum_hi: i32,
    pub isp_iso_low: i32,
    pub isp_iso_hi: i32,
    pub isp_exptime_low: i32,
    pub isp_exptime_hi: i32,
    pub isp_switch_lockout_s: u32,
}

impl Default for NightModeConfig {
    fn default() -> Self {
        NightModeConfig {
            enable: false,
            manual: false,
            grayscale: true,
            ir_sensor_pin: PinCfg(999),
            check_interval_s: 5,
            ir_cut_pin1: PinCfg(999),
            ir_cut_pin2: PinCfg(999),
            ir_led_pin: PinCfg(999),
            white_led_pin: PinCfg(999),
            pin_switch_delay_us: 20,
            adc_device: String::new(),
            adc_threshold: -1,
            isp_lum_low: -1,
            isp_lum_hi: -1,
            isp_iso_low: -1,
            isp_iso_hi: -1,
            isp_exptime_low: -1,
            isp_exptime_hi: -1,
            isp_switch_lockout_s: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IspConfig {
    pub sensor_mirror: bool,
    pub sensor_flip: bool,
    pub mirror: bool,
    pub flip: bool,
    pub antiflicker: i32,
}

impl Default for IspConfig {
    fn default() -> Self {
        IspConfig { sensor_mirror: false, sensor_flip: false, mirror: false, flip: false, antiflicker: 50 }
    }
}

/// Number of overlay slots; regions 2 and 3 double as the reserved ISP debug
/// line 1/line 2 slots when `isp_debug` is on and the user hasn't claimed them.
pub const MAX_OSD: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OsdConfig {
    pub enable: bool,
    pub isp_debug: bool,
    pub regions: Vec<OsdRegionConfig>,
}

impl Default for OsdConfig {
    fn default() -> Self {
        OsdConfig { enable: false, isp_debug: false, regions: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OsdRegionConfig {
    pub text: String,
    pub image_path: String,
    pub font: String,
    pub size: f32,
    pub color_rgb555: u16,
    pub outline_color_rgb555: u16,
    pub outline_thickness: u8,
    pub position_x: i16,
    pub position_y: i16,
    pub opacity_fg: u8,
    pub opacity_bg: u8,
    pub bg_color_rgb555: u16,
    pub padding: u8,
}

impl Default for OsdRegionConfig {
    fn default() -> Self {
        OsdRegionConfig {
            text: String::new(),
            image_path: String::new(),
            font: "DejaVuSansMono".to_string(),
            size: 24.0,
            color_rgb555: 0x7fff,
            outline_color_rgb555: 0,
            outline_thickness: 0,
            position_x: 8,
            position_y: 8,
            opacity_fg: 255,
            opacity_bg: 0,
            bg_color_rgb555: 0,
            padding: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MdnsConfig {
    pub enable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OnvifConfig {
    pub enable: bool,
    pub enable_auth: bool,
    pub auth_user: String,
    pub auth_pass: String,
}

impl Default for OnvifConfig {
    fn default() -> Self {
        OnvifConfig { enable: true, enable_auth: false, auth_user: String::new(), auth_pass: String::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RtspConfig {
    pub enable: bool,
    pub enable_auth: bool,
    pub auth_user: String,
    pub auth_pass: String,
    pub port: u16,
    pub bind: String,
}

impl Default for RtspConfig {
    fn default() -> Self {
        RtspConfig {
            enable: true,
            enable_auth: false,
            auth_user: String::new(),
            auth_pass: String::new(),
            port: 554,
            bind: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecordConfig {
    pub enable: bool,
    pub r#continuous: bool,
    pub filename: String,
    pub path: String,
    pub segment_duration: u32,
    pub segment_size: u64,
}

impl Default for RecordConfig {
    fn default() -> Self {
        RecordConfig {
            enable: false,
            r#continuous: false,
            filename: "%Y%m%d_%H%M%S.mp4".to_string(),
            path: "/mnt/record".to_string(),
            segment_duration: 300,
            segment_size: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub enable: bool,
    pub udp_srcport: u16,
    pub dests: Vec<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig { enable: false, udp_srcport: 0, dests: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Mp3,
    Aac,
}

impl Default for AudioCodec {
    fn default() -> Self {
        AudioCodec::Aac
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub enable: bool,
    pub mute: bool,
    pub codec: AudioCodec,
    pub bitrate: u32,
    pub gain: i32,
    pub srate: u32,
    pub channels: u8,
    pub aac_quantqual: u32,
    pub aac_bandwidth: u32,
    pub aac_tns: bool,
    pub speex_enable: bool,
    pub speex_denoise: bool,
    pub speex_agc: bool,
    pub speex_vad: bool,
    pub speex_dereverb: bool,
    pub speex_frame_size: u32,
    pub speex_noise_suppress_db: i32,
    pub speex_agc_level: i32,
    pub speex_agc_increment: i32,
    pub speex_agc_decrement: i32,
    pub speex_agc_max_gain_db: i32,
    pub speex_vad_prob_start: i32,
    pub speex_vad_prob_continue: i32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            enable: false,
            mute: false,
            codec: AudioCodec::Aac,
            bitrate: 64,
            gain: 0,
            srate: 16000,
            channels: 1,
            aac_quantqual: 0,
            aac_bandwidth: 0,
            aac_tns: false,
            speex_enable: false,
            speex_denoise: true,
            speex_agc: false,
            speex_vad: false,
            speex_dereverb: false,
            speex_frame_size: 0,
            speex_noise_suppress_db: -20,
            speex_agc_level: 8000,
            speex_agc_increment: 12,
            speex_agc_decrement: -40,
            speex_agc_max_gain_db: 30,
            speex_vad_prob_start: 80,
            speex_vad_prob_continue: 65,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Mp4Config {
    pub enable: bool,
    pub codec_h265: bool,
    pub h264_plus: bool,
    pub mode: u32,
    pub fps: u32,
    pub gop: u32,
    pub width: u32,
    pub height: u32,
    pub profile: u32,
    pub bitrate: u32,
}

impl Default for Mp4Config {
    fn default() -> Self {
        Mp4Config {
            enable: true,
            codec_h265: false,
            h264_plus: false,
            mode: 0,
            fps: 25,
            gop: 50,
            width: 1920,
            height: 1080,
            profile: 2,
            bitrate: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JpegConfig {
    pub enable: bool,
    pub osd_enable: bool,
    pub grayscale_night: bool,
    pub mode: u32,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub qfactor: u32,
}

impl Default for JpegConfig {
    fn default() -> Self {
        JpegConfig {
            enable: true,
            osd_enable: true,
            grayscale_night: true,
            mode: 0,
            fps: 10,
            width: 640,
            height: 360,
            qfactor: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpPostConfig {
    pub enable: bool,
    pub host: String,
    pub url: String,
    pub login: String,
    pub password: String,
    pub width: u32,
    pub height: u32,
    pub qfactor: u32,
    pub interval: u32,
}

impl Default for HttpPostConfig {
    fn default() -> Self {
        HttpPostConfig {
            enable: false,
            host: String::new(),
            url: String::new(),
            login: String::new(),
            password: String::new(),
            width: 640,
            height: 360,
            qfactor: 80,
            interval: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub system: SystemConfig,
    pub night_mode: NightModeConfig,
    pub isp: IspConfig,
    pub osd: OsdConfig,
    pub mdns: MdnsConfig,
    pub onvif: OnvifConfig,
    pub rtsp: RtspConfig,
    pub record: RecordConfig,
    pub stream: StreamConfig,
    pub audio: AudioConfig,
    pub mp4: Mp4Config,
    pub jpeg: JpegConfig,
    pub http_post: HttpPostConfig,
}

/// Keep only printable ASCII; drop everything else. Used both to validate
/// `time_format` on load and to repair it when corrupt.
fn sanitize_ascii(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii() && !c.is_ascii_control()).collect()
}

fn is_clean_ascii(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii() && !c.is_ascii_control())
}

/// Drops every byte that isn't printable ASCII, a newline, or a tab. Used to
/// recover a YAML document whose bytes were partially clobbered, by turning
/// it back into something `str::from_utf8` and the YAML parser can accept.
fn sanitize_bytes(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .copied()
        .filter(|&b| b == b'\n' || b == b'\t' || (0x20..0x7f).contains(&b))
        .collect()
}

impl AppConfig {
    /// Load from `path`, repairing a corrupt `time_format` in place.
    ///
    /// The file is read as raw bytes first: a config file clobbered by a
    /// flash write error or a crash mid-save may not even be valid UTF-8,
    /// and `fs::read_to_string` would hard-fail before any repair logic
    /// runs. Invalid bytes are scrubbed and the parse retried before
    /// falling back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;

        let mut cfg = match Self::parse(&bytes) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "config file unreadable, repairing");
                let repaired = sanitize_bytes(&bytes);
                match Self::parse(&repaired) {
                    Ok(cfg) => {
                        cfg.save(path)?;
                        cfg
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "config repair failed, using defaults");
                        let cfg = AppConfig::default();
                        cfg.save(path)?;
                        cfg
                    }
                }
            }
        };

        if !is_clean_ascii(&cfg.system.time_format) {
            tracing::warn!(
                path = %path.display(),
                "time_format is not clean ASCII, repairing to default"
            );
            let repaired = sanitize_ascii(&cfg.system.time_format);
            cfg.system.time_format =
                if repaired.is_empty() { DEFAULT_TIME_FORMAT.to_string() } else { repaired };
            cfg.save(path)?;
        }

        Ok(cfg)
    }

    /// Decodes `bytes` as UTF-8 and parses it as YAML. A non-UTF-8 payload
    /// is reported through the same `io::Error` variant a truncated read
    /// would use, since both mean "this file isn't usable as-is".
    fn parse(bytes: &[u8]) -> Result<Self, ConfigError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ConfigError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        serde_yaml2::from_str(text).map_err(ConfigError::Yaml)
    }

    /// Save atomically: write to a temp file in the same directory, fsync,
    /// then rename over the destination.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(".{}.tmp-{}", file_name(path), std::process::id()));

        let yaml = serde_yaml2::to_string(self).map_err(ConfigError::Yaml)?;
        {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(yaml.as_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().and_then(|s| s.to_str()).unwrap_or("config").to_string()
}

pub fn default_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_time_format() {
        let mut cfg = AppConfig::default();
        cfg.system.time_format = "%Y-%m-%d".to_string();

        let dir = std::env::temp_dir().join(format!("camerad-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");

        cfg.save(&path).unwrap();
        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.system.time_format, "%Y-%m-%d");
        assert_eq!(loaded, cfg);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupt_time_format_repairs_to_default() {
        let dir = std::env::temp_dir().join(format!("camerad-test2-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");

        let mut cfg = AppConfig::default();
        cfg.system.time_format = "bad\u{0}fmt".to_string();
        let yaml = serde_yaml2::to_string(&cfg).unwrap();
        fs::write(&path, yaml).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.system.time_format, "badfmt");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn invalid_utf8_config_is_repaired_instead_of_hard_erroring() {
        let dir = std::env::temp_dir().join(format!("camerad-test3-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");

        let mut cfg = AppConfig::default();
        cfg.system.time_format = "%H:%M".to_string();
        let mut yaml = serde_yaml2::to_string(&cfg).unwrap().into_bytes();
        yaml.extend_from_slice(&[0xff, 0xfe, 0x80]);
        fs::write(&path, &yaml).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.system.time_format, "%H:%M");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unparseable_config_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("camerad-test4-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");

        fs::write(&path, [0xff, 0xfe, 0x00, 0x01]).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, AppConfig::default());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn pin_cfg_disabled_sentinels() {
        assert_eq!(PinCfg(999).resolve(), None);
        assert_eq!(PinCfg(-1).resolve(), None);
        assert_eq!(PinCfg(17).resolve(), Some(17));
        assert_eq!(PinCfg(0).resolve(), Some(0));
    }
}
