//! Shared error types.
//!
//! Domain error enums follow the kinds named in the error handling design:
//! config, HAL/vendor, transport, encoder, mux, filesystem. `anyhow` is used
//! at the edges (main, HTTP handlers), `thiserror` for everything callers
//! need to match on.

use thiserror::Error;

/// Errors surfaced while loading or saving `/etc/camerad.yaml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config key not found: {0}")]
    NotFound(String),
    #[error("config key {key} has wrong type, expected {expected}")]
    WrongType { key: String, expected: &'static str },
    #[error("config key {key} out of range: {value}")]
    OutOfRange { key: String, value: String },
    #[error("config key {key} isn't a number: {value}")]
    NotANumber { key: String, value: String },
    #[error("config key {key} isn't a float: {value}")]
    NotAFloat { key: String, value: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml2::Error),
}

impl ConfigError {
    /// Integer code mirroring the ConfigError enum for the control API JSON
    /// responses, 0 reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            ConfigError::NotFound(_) => 1,
            ConfigError::WrongType { .. } => 2,
            ConfigError::OutOfRange { .. } => 3,
            ConfigError::NotANumber { .. } => 4,
            ConfigError::NotAFloat { .. } => 5,
            ConfigError::Io(_) => 6,
            ConfigError::Yaml(_) => 7,
        }
    }
}

/// Opaque vendor error surfaced by a HAL operation. The core never
/// interprets the code, only logs and propagates it.
#[derive(Debug, Error, Clone)]
#[error("hal error in {op}: kind={kind:?} code=0x{code:x} ({message})")]
pub struct HalError {
    pub op: &'static str,
    pub kind: HalErrorKind,
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalErrorKind {
    NotSupported,
    InvalidArgument,
    DeviceBusy,
    Timeout,
    Vendor,
}

impl HalError {
    pub fn vendor(op: &'static str, code: i64, message: impl Into<String>) -> Self {
        HalError { op, kind: HalErrorKind::Vendor, code, message: message.into() }
    }

    pub fn not_supported(op: &'static str) -> Self {
        HalError { op, kind: HalErrorKind::NotSupported, code: 0, message: "not supported".into() }
    }
}

/// Errors from the fragmented-MP4 muxer.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("decoder config not yet established (no SPS/PPS seen)")]
    NoDecoderConfig,
    #[error("parameter set too large: {0} bytes")]
    ParameterSetTooLarge(usize),
    #[error("slice received before any keyframe")]
    MissingKeyframe,
}

/// Errors from the audio encoders.
#[derive(Debug, Error)]
pub enum AudioEncodeError {
    #[error("unsupported sample rate/bitrate combination: sr={sr} kbps={kbps}")]
    UnsupportedConfig { sr: u32, kbps: u32 },
    #[error("encoder rejected frame: {0}")]
    EncodeFailed(String),
}
