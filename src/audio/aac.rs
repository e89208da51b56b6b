//! AAC-LC encoder backend via `fdk-aac`, raw frames (no ADTS). The core
//! always prepends a 2-byte little-endian length before handing a frame to
//! `enc_queue`, so downstream consumers never need to parse ADTS.

use fdk_aac::enc::{BitRate, ChannelMode, Encoder, EncoderParams, Transport};

use crate::audio::{AudioEncoder, EncodedAudioFrame};
use crate::error::AudioEncodeError;

pub struct AacEncoder {
    enc: Encoder,
    input_samples: usize,
    max_output_bytes: usize,
}

impl AacEncoder {
    pub fn new(
        sample_rate: u32,
        channels: u8,
        bitrate_kbps: u32,
        aac_quantqual: u32,
        aac_bandwidth: u32,
        aac_tns: bool,
    ) -> Result<Self, AudioEncodeError> {
        let channel_mode = match channels {
            1 => ChannelMode::Mono,
            2 => ChannelMode::Stereo,
            _ => return Err(AudioEncodeError::UnsupportedConfig { sr: sample_rate, kbps: bitrate_kbps }),
        };

        let bit_rate = if aac_quantqual > 0 {
            BitRate::VbrVeryHigh
        } else {
            BitRate::Cbr(bitrate_kbps * 1000)
        };

        let params = EncoderParams {
            bit_rate,
            sample_rate,
            transport: Transport::Raw,
            channels: channel_mode,
        };
        let mut enc = Encoder::new(params)
            .map_err(|e| AudioEncodeError::EncodeFailed(format!("fdk-aac init: {e:?}")))?;

        if aac_bandwidth > 0 {
            enc.set_bandwidth(aac_bandwidth)
                .map_err(|e| AudioEncodeError::EncodeFailed(format!("set_bandwidth: {e:?}")))?;
        }
        enc.set_transport_noise_shaping(aac_tns)
            .map_err(|e| AudioEncodeError::EncodeFailed(format!("set_tns: {e:?}")))?;

        let info = enc
            .info()
            .map_err(|e| AudioEncodeError::EncodeFailed(format!("info: {e:?}")))?;

        Ok(AacEncoder {
            enc,
            input_samples: info.frame_length as usize * channels as usize,
            max_output_bytes: info.max_output_bytes as usize,
        })
    }
}

impl AudioEncoder for AacEncoder {
    fn input_samples(&self) -> usize {
        self.input_samples
    }

    fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    fn encode(&mut self, pcm: &[i16], pts_us: u64) -> Result<EncodedAudioFrame, AudioEncodeError> {
        if pcm.len() != self.input_samples {
            return Err(AudioEncodeError::EncodeFailed(format!(
                "expected {} samples, got {}",
                self.input_samples,
                pcm.len()
            )));
        }

        let mut out = vec![0u8; self.max_output_bytes];
        let result = self
            .enc
            .encode(pcm, &mut out)
            .map_err(|e| AudioEncodeError::EncodeFailed(format!("encode: {e:?}")))?;
        out.truncate(result.output_size);

        let mut record = Vec::with_capacity(2 + out.len());
        record.extend_from_slice(&(out.len() as u16).to_le_bytes());
        record.extend_from_slice(&out);

        Ok(EncodedAudioFrame { payload: record, pts_us })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_channel_count() {
        let err = AacEncoder::new(16000, 3, 64, 0, 0, false).unwrap_err();
        matches!(err, AudioEncodeError::UnsupportedConfig { .. });
    }
}
