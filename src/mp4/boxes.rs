//! Low-level ISO-BMFF box writers. Everything here is a pure function over
//! byte buffers — no state, no I/O — the same shape as the reference fMP4
//! encoder this module is grounded on: a `mp4_box(type, payloads)` wrapper
//! plus one function per box, each hand-writing its fixed-layout fields.

use crate::hal::VideoCodec;

pub fn mp4_box(box_type: &[u8; 4], payloads: &[&[u8]]) -> Vec<u8> {
    let size: u32 = 8 + payloads.iter().map(|p| p.len() as u32).sum::<u32>();
    let mut buf = Vec::with_capacity(size as usize);
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(box_type);
    for p in payloads {
        buf.extend_from_slice(p);
    }
    buf
}

pub fn ftyp(codec: VideoCodec) -> Vec<u8> {
    let brand: [u8; 4] = match codec {
        VideoCodec::H264 => *b"avc1",
        VideoCodec::H265 => *b"hev1",
    };
    mp4_box(b"ftyp", &[b"iso5", &[0, 0, 0, 1], b"iso5", &brand])
}

fn mvhd(timescale: u32) -> Vec<u8> {
    let mut b = vec![0u8; 100];
    b[0] = 0; // version
    b[12..16].copy_from_slice(&timescale.to_be_bytes());
    b[16..20].copy_from_slice(&0u32.to_be_bytes()); // duration 0: live
    b[20..24].copy_from_slice(&0x00010000u32.to_be_bytes()); // rate 1.0
    b[24] = 0x01; // volume 1.0
    // unity matrix
    let matrix: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];
    for (i, v) in matrix.iter().enumerate() {
        b[36 + i * 4..40 + i * 4].copy_from_slice(&v.to_be_bytes());
    }
    b[96..100].copy_from_slice(&0xffffffffu32.to_be_bytes()); // next_track_ID
    mp4_box(b"mvhd", &[&b])
}

struct TrackLayout {
    id: u32,
    timescale: u32,
    width: u16,
    height: u16,
    handler: &'static [u8; 4],
    handler_name: &'static str,
    media_header: Vec<u8>,
    sample_entry: Vec<u8>,
}

fn tkhd(id: u32, width: u16, height: u16) -> Vec<u8> {
    let mut b = vec![0u8; 84];
    b[3] = 0x07; // flags: enabled, in_movie, in_preview
    b[12..16].copy_from_slice(&id.to_be_bytes());
    let matrix: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];
    for (i, v) in matrix.iter().enumerate() {
        b[32 + i * 4..36 + i * 4].copy_from_slice(&v.to_be_bytes());
    }
    b[76..78].copy_from_slice(&width.to_be_bytes());
    b[80..82].copy_from_slice(&height.to_be_bytes());
    mp4_box(b"tkhd", &[&b])
}

fn mdhd(timescale: u32) -> Vec<u8> {
    let mut b = vec![0u8; 20];
    b[12..16].copy_from_slice(&timescale.to_be_bytes());
    b[16..18].copy_from_slice(&[0x55, 0xc4]); // 'und'
    mp4_box(b"mdhd", &[&b])
}

fn hdlr(handler_type: &[u8; 4], name: &str) -> Vec<u8> {
    let mut b = vec![0u8; 24];
    b[8..12].copy_from_slice(handler_type);
    let mut name_bytes = name.as_bytes().to_vec();
    name_bytes.push(0);
    b.extend_from_slice(&name_bytes);
    mp4_box(b"hdlr", &[&b])
}

fn dinf() -> Vec<u8> {
    let dref_entry: [u8; 12] = [0, 0, 0, 1, b'u', b'r', b'l', b' ', 0, 0, 0, 1];
    let mut dref = vec![0u8; 4];
    dref.extend_from_slice(&1u32.to_be_bytes());
    dref.extend_from_slice(&dref_entry);
    mp4_box(b"dinf", &[&mp4_box(b"dref", &[&dref])])
}

fn stbl_empty(sample_entry: &[u8]) -> Vec<u8> {
    const EMPTY_STTS: [u8; 8] = [0, 0, 0, 0, 0, 0, 0, 0];
    const EMPTY_STSC: [u8; 8] = EMPTY_STTS;
    const EMPTY_STCO: [u8; 8] = EMPTY_STTS;
    let empty_stsz: [u8; 12] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    let mut stsd = vec![0u8; 4];
    stsd.extend_from_slice(&1u32.to_be_bytes());
    stsd.extend_from_slice(sample_entry);

    mp4_box(
        b"stbl",
        &[
            &mp4_box(b"stsd", &[&stsd]),
            &mp4_box(b"stts", &[&EMPTY_STTS]),
            &mp4_box(b"stsc", &[&EMPTY_STSC]),
            &mp4_box(b"stsz", &[&empty_stsz]),
            &mp4_box(b"stco", &[&EMPTY_STCO]),
        ],
    )
}

fn trak(layout: &TrackLayout) -> Vec<u8> {
    let vmhd_smhd: Vec<u8> = if layout.handler == b"vide" {
        mp4_box(b"vmhd", &[&[0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0]])
    } else {
        mp4_box(b"smhd", &[&[0, 0, 0, 0, 0, 0, 0, 0]])
    };
    let minf = mp4_box(
        b"minf",
        &[&vmhd_smhd, &dinf(), &stbl_empty(&layout.sample_entry)],
    );
    let mdia = mp4_box(
        b"mdia",
        &[
            &mdhd(layout.timescale),
            &hdlr(layout.handler, layout.handler_name),
            &minf,
        ],
    );
    mp4_box(b"trak", &[&tkhd(layout.id, layout.width, layout.height), &mdia])
}

fn trex(track_id: u32) -> Vec<u8> {
    let mut b = vec![0u8; 20];
    b[4..8].copy_from_slice(&track_id.to_be_bytes());
    b[8..12].copy_from_slice(&1u32.to_be_bytes()); // default_sample_description_index
    b[20 - 4..20].copy_from_slice(&0x00010001u32.to_be_bytes()); // default_sample_flags
    mp4_box(b"trex", &[&b])
}

fn avcc(profile: u8, profile_compat: u8, level: u8, sps_list: &[Vec<u8>], pps_list: &[Vec<u8>]) -> Vec<u8> {
    let mut b = vec![0x01, profile, profile_compat, level, 0xff, 0xe0 | sps_list.len() as u8];
    for sps in sps_list {
        b.extend_from_slice(&(sps.len() as u16).to_be_bytes());
        b.extend_from_slice(sps);
    }
    b.push(pps_list.len() as u8);
    for pps in pps_list {
        b.extend_from_slice(&(pps.len() as u16).to_be_bytes());
        b.extend_from_slice(pps);
    }
    mp4_box(b"avcC", &[&b])
}

fn hvcc(vps: &[u8], sps: &[u8], pps: &[u8]) -> Vec<u8> {
    // HEVCDecoderConfigurationRecord, minimal general-profile fields zeroed
    // (players reconstruct the real profile/tier from the VPS/SPS NAL
    // itself; only the parameter-set arrays are load-bearing for MSE).
    let mut b = vec![0u8; 22];
    b[0] = 0x01; // configurationVersion
    b[21] = 3; // num_arrays

    fn nal_array(nal_type: u8, units: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![0x80 | nal_type];
        out.extend_from_slice(&(units.len() as u16).to_be_bytes());
        for u in units {
            out.extend_from_slice(&(u.len() as u16).to_be_bytes());
            out.extend_from_slice(u);
        }
        out
    }

    b.extend_from_slice(&nal_array(32, &[vps])); // VPS_NUT
    b.extend_from_slice(&nal_array(33, &[sps])); // SPS_NUT
    b.extend_from_slice(&nal_array(34, &[pps])); // PPS_NUT

    mp4_box(b"hvcC", &[&b])
}

fn sample_entry_video(codec: VideoCodec, width: u16, height: u16, config_box: Vec<u8>) -> Vec<u8> {
    let fourcc: &[u8; 4] = match codec {
        VideoCodec::H264 => b"avc1",
        VideoCodec::H265 => b"hev1",
    };
    let mut b = vec![0u8; 78];
    b[6..8].copy_from_slice(&1u16.to_be_bytes()); // data_reference_index
    b[24..26].copy_from_slice(&width.to_be_bytes());
    b[26..28].copy_from_slice(&height.to_be_bytes());
    b[28..32].copy_from_slice(&0x00480000u32.to_be_bytes()); // horizresolution 72dpi
    b[32..36].copy_from_slice(&0x00480000u32.to_be_bytes()); // vertresolution
    b[40..42].copy_from_slice(&1u16.to_be_bytes()); // frame_count
    b[75..77].copy_from_slice(&24u16.to_be_bytes()); // depth
    b[77] = 0xff;
    let mut entry = b;
    entry.extend_from_slice(&config_box);
    mp4_box(fourcc, &[&entry])
}

/// MPEG-4 AudioSpecificConfig, object type 2 (AAC-LC).
fn aac_audio_specific_config(sample_rate: u32, channels: u8) -> Vec<u8> {
    let freq_index: u8 = match sample_rate {
        96000 => 0,
        88200 => 1,
        64000 => 2,
        48000 => 3,
        44100 => 4,
        32000 => 5,
        24000 => 6,
        22050 => 7,
        16000 => 8,
        12000 => 9,
        11025 => 10,
        8000 => 11,
        _ => 8,
    };
    let object_type: u8 = 2; // AAC LC
    let b0 = (object_type << 3) | (freq_index >> 1);
    let b1 = (freq_index << 7) | (channels << 3);
    vec![b0, b1]
}

fn esds(object_type_indication: u8, decoder_specific: &[u8]) -> Vec<u8> {
    // Simplified ES_Descriptor: no size-of-instance expand-length bytes
    // beyond a direct 1-byte length (values here never exceed 127 bytes).
    let mut dec_config = vec![
        0x04,
        (13 + decoder_specific.len()) as u8,
        object_type_indication,
        0x15, // streamType (audio) << 2 | upStream | reserved
        0x00, 0x00, 0x00, // bufferSizeDB
        0x00, 0x00, 0x00, 0x00, // maxBitrate
        0x00, 0x00, 0x00, 0x00, // avgBitrate
    ];
    dec_config.push(0x05);
    dec_config.push(decoder_specific.len() as u8);
    dec_config.extend_from_slice(decoder_specific);

    let mut es = vec![0x03, (3 + dec_config.len() + 3) as u8, 0x00, 0x01, 0x00];
    es.extend_from_slice(&dec_config);
    es.extend_from_slice(&[0x06, 0x01, 0x02]); // SLConfigDescriptor, predefined

    let mut full_box = vec![0u8; 4];
    full_box.extend_from_slice(&es);
    mp4_box(b"esds", &[&full_box])
}

fn sample_entry_audio_aac(sample_rate: u32, channels: u8) -> Vec<u8> {
    let asc = aac_audio_specific_config(sample_rate, channels);
    let mut b = vec![0u8; 28];
    b[6..8].copy_from_slice(&1u16.to_be_bytes()); // data_reference_index
    b[16..18].copy_from_slice(&(channels as u16).to_be_bytes());
    b[18..20].copy_from_slice(&16u16.to_be_bytes()); // samplesize
    b[24..28].copy_from_slice(&((sample_rate as u32) << 16).to_be_bytes());
    let mut entry = b;
    entry.extend_from_slice(&esds(0x40, &asc)); // 0x40 = MPEG-4 AAC
    mp4_box(b"mp4a", &[&entry])
}

fn sample_entry_audio_mp3(sample_rate: u32, channels: u8) -> Vec<u8> {
    let mut b = vec![0u8; 28];
    b[6..8].copy_from_slice(&1u16.to_be_bytes());
    b[16..18].copy_from_slice(&(channels as u16).to_be_bytes());
    b[18..20].copy_from_slice(&16u16.to_be_bytes());
    b[24..28].copy_from_slice(&((sample_rate as u32) << 16).to_be_bytes());
    let mut entry = b;
    // object type indication 0x6B = MPEG-1 Layer III, no decoder-specific bytes.
    entry.extend_from_slice(&esds(0x6b, &[]));
    mp4_box(b"mp4a", &[&entry])
}

pub enum AudioSampleConfig {
    Aac { sample_rate: u32, channels: u8 },
    Mp3 { sample_rate: u32, channels: u8 },
}

/// Video decoder config captured from the first keyframe's parameter sets.
pub struct VideoDecoderConfig {
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
    pub vps: Option<Vec<u8>>,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

pub const VIDEO_TIMESCALE: u32 = 90_000;
pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;

/// Builds the self-contained `ftyp`+`moov` initialization segment. Callable
/// repeatedly: when SPS/PPS/VPS change, the core rebuilds this for future
/// clients while existing clients keep the one they already received.
pub fn init_segment(video: &VideoDecoderConfig, audio: Option<&AudioSampleConfig>) -> Vec<u8> {
    let config_box = match video.codec {
        VideoCodec::H264 => avcc(video.sps[1], video.sps[2], video.sps[3], &[video.sps.clone()], &[video.pps.clone()]),
        VideoCodec::H265 => hvcc(
            video.vps.as_deref().unwrap_or(&[]),
            &video.sps,
            &video.pps,
        ),
    };
    let video_sample_entry = sample_entry_video(video.codec, video.width, video.height, config_box);

    let video_layout = TrackLayout {
        id: VIDEO_TRACK_ID,
        timescale: VIDEO_TIMESCALE,
        width: video.width,
        height: video.height,
        handler: b"vide",
        handler_name: "VideoHandler",
        media_header: vec![],
        sample_entry: video_sample_entry,
    };

    let mut tracks = vec![trak(&video_layout)];
    let mut trex_boxes = vec![trex(VIDEO_TRACK_ID)];

    if let Some(audio) = audio {
        let (sample_rate, channels, sample_entry) = match *audio {
            AudioSampleConfig::Aac { sample_rate, channels } => {
                (sample_rate, channels, sample_entry_audio_aac(sample_rate, channels))
            }
            AudioSampleConfig::Mp3 { sample_rate, channels } => {
                (sample_rate, channels, sample_entry_audio_mp3(sample_rate, channels))
            }
        };
        let audio_layout = TrackLayout {
            id: AUDIO_TRACK_ID,
            timescale: sample_rate,
            width: 0,
            height: 0,
            handler: b"soun",
            handler_name: "SoundHandler",
            media_header: vec![],
            sample_entry,
        };
        let _ = channels;
        tracks.push(trak(&audio_layout));
        trex_boxes.push(trex(AUDIO_TRACK_ID));
    }

    let mvex = mp4_box(b"mvex", &trex_boxes.iter().map(|v| v.as_slice()).collect::<Vec<_>>());
    let mvhd = mvhd(VIDEO_TIMESCALE);

    let mut moov_payloads: Vec<&[u8]> = vec![&mvhd];
    for t in &tracks {
        moov_payloads.push(t);
    }
    moov_payloads.push(&mvex);
    let moov = mp4_box(b"moov", &moov_payloads);

    let mut out = ftyp(video.codec);
    out.extend_from_slice(&moov);
    out
}

pub struct SampleMeta {
    pub size: u32,
    pub duration: u32,
    pub is_keyframe: bool,
}

fn sample_flags(is_keyframe: bool) -> [u8; 4] {
    let depends_on: u8 = if is_keyframe { 2 } else { 1 };
    let is_non_sync: u8 = if is_keyframe { 0 } else { 1 };
    [depends_on, is_non_sync, 0, 0]
}

fn mfhd(sequence_number: u32) -> Vec<u8> {
    let mut b = vec![0u8; 4];
    b.extend_from_slice(&sequence_number.to_be_bytes());
    mp4_box(b"mfhd", &[&b])
}

fn tfhd(track_id: u32) -> Vec<u8> {
    // flags = 0x020000: default-base-is-moof is NOT set, base-data-offset
    // IS present (explicit per-fragment byte offset).
    let mut b = vec![0x00, 0x00, 0x00, 0x01];
    b.extend_from_slice(&track_id.to_be_bytes());
    mp4_box(b"tfhd", &[&b])
}

fn tfdt(base_media_decode_time: u64) -> Vec<u8> {
    // version 1: 64-bit baseMediaDecodeTime, required once decode time
    // exceeds 32 bits of a 90kHz clock (~13.3 hours).
    let mut b = vec![0x01, 0x00, 0x00, 0x00];
    b.extend_from_slice(&base_media_decode_time.to_be_bytes());
    mp4_box(b"tfdt", &[&b])
}

fn trun(base_data_offset: u64, samples: &[SampleMeta]) -> Vec<u8> {
    let sample_count = samples.len() as u32;
    let mut b = vec![0x00, 0x00, 0x0f, 0x01]; // flags: data-offset, duration, size, flags present
    b.extend_from_slice(&sample_count.to_be_bytes());
    b.extend_from_slice(&(base_data_offset as i32).to_be_bytes());
    for s in samples {
        b.extend_from_slice(&s.duration.to_be_bytes());
        b.extend_from_slice(&s.size.to_be_bytes());
        b.extend_from_slice(&sample_flags(s.is_keyframe));
    }
    mp4_box(b"trun", &[&b])
}

fn traf(track_id: u32, base_media_decode_time: u64, base_data_offset: u64, samples: &[SampleMeta]) -> Vec<u8> {
    let tfhd = tfhd(track_id);
    let tfdt = tfdt(base_media_decode_time);
    let trun = trun(base_data_offset, samples);
    mp4_box(b"traf", &[&tfhd, &tfdt, &trun])
}

/// Builds one `moof` box for a single track's fragment.
pub fn moof(sequence_number: u32, track_id: u32, base_media_decode_time: u64, base_data_offset: u64, samples: &[SampleMeta]) -> Vec<u8> {
    let mfhd = mfhd(sequence_number);
    let traf = traf(track_id, base_media_decode_time, base_data_offset, samples);
    mp4_box(b"moof", &[&mfhd, &traf])
}

/// Builds `mdat` with NALUs 4-byte length-prefixed (not start-code prefixed).
pub fn mdat_video(nalus: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = Vec::new();
    for n in nalus {
        payload.extend_from_slice(&(n.len() as u32).to_be_bytes());
        payload.extend_from_slice(n);
    }
    mp4_box(b"mdat", &[&payload])
}

pub fn mdat_audio(frame: &[u8]) -> Vec<u8> {
    mp4_box(b"mdat", &[frame])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_size_includes_header() {
        let b = mp4_box(b"test", &[&[1, 2, 3, 4]]);
        assert_eq!(b.len(), 12);
        assert_eq!(&b[0..4], &12u32.to_be_bytes());
        assert_eq!(&b[4..8], b"test");
    }

    #[test]
    fn mfhd_encodes_sequence_number() {
        let b = mfhd(7);
        assert_eq!(&b[b.len() - 4..], &7u32.to_be_bytes());
    }

    #[test]
    fn trun_sample_flags_mark_keyframe_vs_non_sync() {
        let kf = sample_flags(true);
        let p = sample_flags(false);
        assert_eq!(kf[0], 2);
        assert_eq!(kf[1], 0);
        assert_eq!(p[0], 1);
        assert_eq!(p[1], 1);
    }

    #[test]
    fn mdat_video_is_length_prefixed_not_start_coded() {
        let nalus = vec![vec![0x65, 0xaa, 0xbb]];
        let b = mdat_video(&nalus);
        // box header (8) + 4-byte length + 3-byte NAL
        assert_eq!(b.len(), 8 + 4 + 3);
        assert_eq!(&b[8..12], &3u32.to_be_bytes());
    }
}
