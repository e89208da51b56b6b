//! MPEG-1 Layer III encoder backend via `mp3lame-encoder`.

use mp3lame_encoder::{max_required_buffer_size, Bitrate, Builder, InterleavedPcm, Quality};

use crate::audio::{AudioEncoder, EncodedAudioFrame};
use crate::error::AudioEncodeError;

fn frame_size(sample_rate: u32, bitrate_kbps: u32) -> usize {
    let coeff = if sample_rate >= 32000 { 144 } else { 72 };
    (coeff * bitrate_kbps as usize * 1000) / sample_rate as usize
}

fn bitrate_enum(kbps: u32) -> Option<Bitrate> {
    Some(match kbps {
        8 => Bitrate::Kbps8,
        16 => Bitrate::Kbps16,
        24 => Bitrate::Kbps24,
        32 => Bitrate::Kbps32,
        40 => Bitrate::Kbps40,
        48 => Bitrate::Kbps48,
        56 => Bitrate::Kbps56,
        64 => Bitrate::Kbps64,
        80 => Bitrate::Kbps80,
        96 => Bitrate::Kbps96,
        112 => Bitrate::Kbps112,
        128 => Bitrate::Kbps128,
        160 => Bitrate::Kbps160,
        192 => Bitrate::Kbps192,
        224 => Bitrate::Kbps224,
        256 => Bitrate::Kbps256,
        320 => Bitrate::Kbps320,
        _ => return None,
    })
}

pub struct Mp3Encoder {
    lame: mp3lame_encoder::Encoder,
    channels: u8,
    frame_bytes: usize,
    samples_per_pass: usize,
}

impl Mp3Encoder {
    pub fn new(sample_rate: u32, channels: u8, bitrate_kbps: u32) -> Result<Self, AudioEncodeError> {
        if !matches!(sample_rate, 32000 | 44100 | 48000) {
            return Err(AudioEncodeError::UnsupportedConfig { sr: sample_rate, kbps: bitrate_kbps });
        }
        let bitrate = bitrate_enum(bitrate_kbps)
            .ok_or(AudioEncodeError::UnsupportedConfig { sr: sample_rate, kbps: bitrate_kbps })?;

        let mut builder =
            Builder::new().ok_or_else(|| AudioEncodeError::EncodeFailed("lame builder init failed".into()))?;
        builder
            .set_num_channels(channels)
            .map_err(|e| AudioEncodeError::EncodeFailed(format!("{e:?}")))?;
        builder
            .set_sample_rate(sample_rate)
            .map_err(|e| AudioEncodeError::EncodeFailed(format!("{e:?}")))?;
        builder.set_brate(bitrate).map_err(|e| AudioEncodeError::EncodeFailed(format!("{e:?}")))?;
        builder
            .set_quality(Quality::Good)
            .map_err(|e| AudioEncodeError::EncodeFailed(format!("{e:?}")))?;
        let lame = builder.build().map_err(|e| AudioEncodeError::EncodeFailed(format!("{e:?}")))?;

        // 1152 source samples is LAME's native MP3 analysis window; the
        // core accumulates PCM until this many samples per channel arrive.
        let samples_per_pass = 1152;

        Ok(Mp3Encoder {
            lame,
            channels,
            frame_bytes: frame_size(sample_rate, bitrate_kbps),
            samples_per_pass,
        })
    }
}

impl AudioEncoder for Mp3Encoder {
    fn input_samples(&self) -> usize {
        self.samples_per_pass * self.channels as usize
    }

    fn max_output_bytes(&self) -> usize {
        // Generous upper bound; actual frames are `frame_size()` bytes.
        self.frame_bytes.max(max_required_buffer_size(self.samples_per_pass))
    }

    fn encode(&mut self, pcm: &[i16], pts_us: u64) -> Result<EncodedAudioFrame, AudioEncodeError> {
        let mut out = Vec::with_capacity(max_required_buffer_size(pcm.len()));
        let input = InterleavedPcm(pcm);
        let written = self
            .lame
            .encode(input, out.spare_capacity_mut())
            .map_err(|e| AudioEncodeError::EncodeFailed(format!("{e:?}")))?;
        unsafe {
            out.set_len(written);
        }
        Ok(EncodedAudioFrame { payload: out, pts_us })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_low_branch_at_8000() {
        assert_eq!(frame_size(8000, 8), 72 * 8 * 1000 / 8000);
    }

    #[test]
    fn frame_size_high_branch_at_48000() {
        assert_eq!(frame_size(48000, 192), 144 * 192 * 1000 / 48000);
    }

    #[test]
    fn frame_size_boundary_at_32000() {
        // sr >= 32000 selects the high-branch coefficient exactly at 32000.
        assert_eq!(frame_size(32000, 128), 144 * 128 * 1000 / 32000);
        assert_eq!(frame_size(31999, 128), 72 * 128 * 1000 / 31999);
    }
}
