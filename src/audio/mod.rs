//! Audio encoder: two interchangeable backends selected at startup from
//! config, producing the frames D/E/F/G consume from `enc_queue`.

pub mod aac;
pub mod mp3;
pub mod speex;

use crate::config::AudioCodec;
use crate::error::AudioEncodeError;

/// One complete encoded frame ready to hand to the muxer and fan-out.
#[derive(Debug, Clone)]
pub struct EncodedAudioFrame {
    /// Raw MP3 frame bytes, or an AAC record already prefixed with its
    /// 2-byte little-endian length — the core never re-frames this.
    pub payload: Vec<u8>,
    pub pts_us: u64,
}

pub trait AudioEncoder: Send {
    /// Samples required per `encode` call (the encoder's native frame size).
    fn input_samples(&self) -> usize;
    fn max_output_bytes(&self) -> usize;
    fn encode(&mut self, pcm: &[i16], pts_us: u64) -> Result<EncodedAudioFrame, AudioEncodeError>;
}

pub fn build_encoder(
    codec: AudioCodec,
    sample_rate: u32,
    channels: u8,
    bitrate_kbps: u32,
    aac_quantqual: u32,
    aac_bandwidth: u32,
    aac_tns: bool,
) -> Result<Box<dyn AudioEncoder>, AudioEncodeError> {
    match codec {
        AudioCodec::Mp3 => {
            Ok(Box::new(mp3::Mp3Encoder::new(sample_rate, channels, bitrate_kbps)?))
        }
        AudioCodec::Aac => Ok(Box::new(aac::AacEncoder::new(
            sample_rate,
            channels,
            bitrate_kbps,
            aac_quantqual,
            aac_bandwidth,
            aac_tns,
        )?)),
    }
}

/// Zero out PCM in place when mute is active. The encoder still runs over
/// the silenced buffer so downstream timing (frame cadence, pts) is
/// unaffected by mute toggling.
pub fn apply_mute(pcm: &mut [i16], mute: bool) {
    if mute {
        pcm.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mute_zeros_samples_without_changing_length() {
        let mut pcm = vec![100i16, -200, 300, -400];
        let len = pcm.len();
        apply_mute(&mut pcm, true);
        assert_eq!(pcm.len(), len);
        assert!(pcm.iter().all(|&s| s == 0));
    }

    #[test]
    fn no_mute_leaves_samples_untouched() {
        let mut pcm = vec![1i16, 2, 3];
        apply_mute(&mut pcm, false);
        assert_eq!(pcm, vec![1, 2, 3]);
    }
}
