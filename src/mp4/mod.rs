//! Fragmented MP4 muxer: maintains the shared decoder config and hands out
//! `moof`+`mdat` pairs keyed by per-client state owned by the delivery
//! fan-out table.

pub mod boxes;

use crate::error::MuxError;
use crate::hal::VideoCodec;

/// Per-client fragment sequencing state; lives in the fan-out client row.
#[derive(Debug, Clone)]
pub struct Mp4ClientState {
    pub sequence_number: u32,
    pub base_media_decode_time: u64,
    /// Cumulative bytes emitted to this client across all prior segments,
    /// used as `base-data-offset` in `tfhd`.
    pub cumulative_bytes: u64,
    pub got_init_segment: bool,
}

impl Mp4ClientState {
    pub fn new() -> Self {
        Mp4ClientState {
            sequence_number: 0,
            base_media_decode_time: 0,
            cumulative_bytes: 0,
            got_init_segment: false,
        }
    }
}

impl Default for Mp4ClientState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct PendingVideoGroup {
    nalus: Vec<Vec<u8>>,
    is_keyframe: bool,
    duration_90k: u32,
}

pub struct Mp4Muxer {
    width: u16,
    height: u16,
    codec: VideoCodec,
    audio: Option<boxes::AudioSampleConfig>,

    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    vps: Option<Vec<u8>>,

    cached_init_segment: Option<Vec<u8>>,
    pending_group: Option<PendingVideoGroup>,
}

impl Mp4Muxer {
    pub fn new(width: u32, height: u32, codec: VideoCodec) -> Self {
        Mp4Muxer {
            width: width as u16,
            height: height as u16,
            codec,
            audio: None,
            sps: None,
            pps: None,
            vps: None,
            cached_init_segment: None,
            pending_group: None,
        }
    }

    /// Reconfigures the audio track declaration. Changing this (or any
    /// parameter-set change from `ingest_video`) invalidates the cached
    /// init segment for *future* clients; clients already holding one keep
    /// it.
    pub fn set_config(
        &mut self,
        width: u32,
        height: u32,
        audio_codec: Option<crate::config::AudioCodec>,
        audio_bitrate_kbps: u32,
        audio_channels: u8,
        audio_srate: u32,
    ) {
        let _ = audio_bitrate_kbps;
        self.width = width as u16;
        self.height = height as u16;
        self.audio = audio_codec.map(|c| match c {
            crate::config::AudioCodec::Aac => {
                boxes::AudioSampleConfig::Aac { sample_rate: audio_srate, channels: audio_channels }
            }
            crate::config::AudioCodec::Mp3 => {
                boxes::AudioSampleConfig::Mp3 { sample_rate: audio_srate, channels: audio_channels }
            }
        });
        self.cached_init_segment = None;
    }

    /// Extracts SPS/PPS/VPS from an Annex-B-stripped NAL list, updating the
    /// cached parameter sets if they changed.
    fn capture_parameter_sets(&mut self, nalus: &[Vec<u8>]) {
        let mut changed = false;
        for nal in nalus {
            if nal.is_empty() {
                continue;
            }
            match self.codec {
                VideoCodec::H264 => {
                    let nal_type = nal[0] & 0x1f;
                    match nal_type {
                        7 => {
                            if self.sps.as_deref() != Some(nal.as_slice()) {
                                self.sps = Some(nal.clone());
                                changed = true;
                            }
                        }
                        8 => {
                            if self.pps.as_deref() != Some(nal.as_slice()) {
                                self.pps = Some(nal.clone());
                                changed = true;
                            }
                        }
                        _ => {}
                    }
                }
                VideoCodec::H265 => {
                    let nal_type = (nal[0] >> 1) & 0x3f;
                    match nal_type {
                        32 => {
                            if self.vps.as_deref() != Some(nal.as_slice()) {
                                self.vps = Some(nal.clone());
                                changed = true;
                            }
                        }
                        33 => {
                            if self.sps.as_deref() != Some(nal.as_slice()) {
                                self.sps = Some(nal.clone());
                                changed = true;
                            }
                        }
                        34 => {
                            if self.pps.as_deref() != Some(nal.as_slice()) {
                                self.pps = Some(nal.clone());
                                changed = true;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        if changed {
            self.cached_init_segment = None;
        }
    }

    /// Ingests one decoded access unit. `nalus` are Annex-B start-code
    /// stripped. Parameter-set NALs are captured and excluded from the
    /// eventual `mdat`; slice NALs accumulate into the pending group until
    /// the next keyframe closes it.
    ///
    /// Returns the completed group (non-parameter-set NALUs only) when a
    /// new keyframe starts one, replacing the previous pending group.
    pub fn ingest_video(
        &mut self,
        nalus: Vec<Vec<u8>>,
        is_keyframe: bool,
        duration_90k: u32,
    ) -> Result<Option<(Vec<Vec<u8>>, bool)>, MuxError> {
        self.capture_parameter_sets(&nalus);

        let slice_nalus: Vec<Vec<u8>> = nalus
            .into_iter()
            .filter(|n| {
                if n.is_empty() {
                    return false;
                }
                match self.codec {
                    VideoCodec::H264 => !matches!(n[0] & 0x1f, 7 | 8),
                    VideoCodec::H265 => !matches!((n[0] >> 1) & 0x3f, 32 | 33 | 34),
                }
            })
            .collect();

        if slice_nalus.is_empty() {
            return Ok(None);
        }

        if is_keyframe {
            if self.sps.is_none() || self.pps.is_none() {
                return Err(MuxError::NoDecoderConfig);
            }
            let finished = self.pending_group.take().map(|g| (g.nalus, g.is_keyframe));
            self.pending_group =
                Some(PendingVideoGroup { nalus: slice_nalus, is_keyframe: true, duration_90k });
            Ok(finished)
        } else {
            match &mut self.pending_group {
                Some(group) => {
                    group.nalus.extend(slice_nalus);
                    Ok(None)
                }
                None => Err(MuxError::MissingKeyframe),
            }
        }
    }

    pub fn get_init_segment(&mut self) -> Result<Vec<u8>, MuxError> {
        if let Some(cached) = &self.cached_init_segment {
            return Ok(cached.clone());
        }
        let sps = self.sps.clone().ok_or(MuxError::NoDecoderConfig)?;
        let pps = self.pps.clone().ok_or(MuxError::NoDecoderConfig)?;
        if sps.len() > u16::MAX as usize || pps.len() > u16::MAX as usize {
            return Err(MuxError::ParameterSetTooLarge(sps.len().max(pps.len())));
        }
        let config = boxes::VideoDecoderConfig {
            codec: self.codec,
            width: self.width,
            height: self.height,
            vps: self.vps.clone(),
            sps,
            pps,
        };
        let segment = boxes::init_segment(&config, self.audio.as_ref());
        self.cached_init_segment = Some(segment.clone());
        Ok(segment)
    }

    /// Builds the `moof` for a finished video group against `client`'s
    /// sequencing state, advancing it. Must be called before `get_mdat` for
    /// the same group.
    pub fn get_moof(
        &self,
        client: &mut Mp4ClientState,
        nalus: &[Vec<u8>],
        is_keyframe: bool,
        duration_90k: u32,
    ) -> Vec<u8> {
        let size: u32 = nalus.iter().map(|n| 4 + n.len() as u32).sum();
        let sample = boxes::SampleMeta { size, duration: duration_90k, is_keyframe };
        let moof = boxes::moof(
            client.sequence_number,
            boxes::VIDEO_TRACK_ID,
            client.base_media_decode_time,
            client.cumulative_bytes,
            &[sample],
        );
        client.sequence_number += 1;
        client.base_media_decode_time += duration_90k as u64;
        moof
    }

    pub fn get_mdat(&self, client: &mut Mp4ClientState, nalus: &[Vec<u8>]) -> Vec<u8> {
        let mdat = boxes::mdat_video(nalus);
        client.cumulative_bytes += mdat.len() as u64;
        mdat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sps_pps() -> (Vec<u8>, Vec<u8>) {
        (vec![0x67, 0x42, 0x00, 0x1f, 0x96], vec![0x68, 0xce, 0x3c, 0x80])
    }

    #[test]
    fn sequence_number_matches_fragment_index() {
        let mut mux = Mp4Muxer::new(640, 480, VideoCodec::H264);
        let (sps, pps) = sps_pps();
        let mut client = Mp4ClientState::new();

        mux.ingest_video(vec![sps.clone(), pps.clone(), vec![0x65, 1, 2]], true, 3000).unwrap();
        let finished = mux
            .ingest_video(vec![sps.clone(), pps.clone(), vec![0x65, 3, 4]], true, 3000)
            .unwrap()
            .unwrap();

        let moof0 = mux.get_moof(&mut client, &finished.0, finished.1, 3000);
        assert_eq!(client.sequence_number, 1);
        let _ = mux.get_mdat(&mut client, &finished.0);

        let finished2 = mux
            .ingest_video(vec![sps, pps, vec![0x65, 5, 6]], true, 3000)
            .unwrap()
            .unwrap();
        let moof1 = mux.get_moof(&mut client, &finished2.0, finished2.1, 3000);
        assert_eq!(client.sequence_number, 2);
        assert_ne!(moof0, moof1);
    }

    #[test]
    fn base_media_decode_time_is_monotonic() {
        let mut client = Mp4ClientState::new();
        let mux = Mp4Muxer::new(640, 480, VideoCodec::H264);
        let nalus = vec![vec![0x65, 1]];
        mux.get_moof(&mut client, &nalus, true, 3000);
        let t0 = client.base_media_decode_time;
        mux.get_moof(&mut client, &nalus, false, 3000);
        let t1 = client.base_media_decode_time;
        assert!(t1 > t0);
    }

    #[test]
    fn missing_keyframe_before_any_slice_errors() {
        let mut mux = Mp4Muxer::new(640, 480, VideoCodec::H264);
        let err = mux.ingest_video(vec![vec![0x41, 1, 2]], false, 3000).unwrap_err();
        matches!(err, MuxError::MissingKeyframe);
    }

    #[test]
    fn init_segment_requires_decoder_config() {
        let mut mux = Mp4Muxer::new(640, 480, VideoCodec::H264);
        assert!(mux.get_init_segment().is_err());
    }
}
