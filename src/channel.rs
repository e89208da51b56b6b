//! Fixed-size channel registry.
//!
//! The registry is the single source of truth for "is this channel enabled
//! and what codec is it carrying" — fan-out, RTSP, and the recorder all
//! query it by index rather than holding their own copy of channel state,
//! the same separation between session identity and the pipeline acting on
//! it that a `CallState`/media-session split would keep.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::hal::VideoCodec;

fn codec_to_u8(codec: VideoCodec) -> u8 {
    match codec {
        VideoCodec::H264 => 0,
        VideoCodec::H265 => 1,
    }
}

fn codec_from_u8(v: u8) -> VideoCodec {
    match v {
        1 => VideoCodec::H265,
        _ => VideoCodec::H264,
    }
}

struct Slot {
    enabled: AtomicBool,
    codec: AtomicU8,
    file_desc: AtomicU8,
}

impl Slot {
    fn new() -> Self {
        Slot { enabled: AtomicBool::new(false), codec: AtomicU8::new(0), file_desc: AtomicU8::new(0) }
    }
}

/// Snapshot of a slot's observable state, read without holding the
/// allocation lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub enabled: bool,
    pub codec: VideoCodec,
    pub file_desc: u8,
}

pub struct ChannelRegistry {
    slots: Vec<Slot>,
    /// Guards allocation only; `enabled`/`codec`/`file_desc` reads never
    /// take this lock.
    alloc_lock: Mutex<()>,
}

impl ChannelRegistry {
    pub fn new(capacity: usize) -> Self {
        ChannelRegistry {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            alloc_lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Scans low-to-high for a free slot, marks it enabled, and returns its
    /// index. Returns `None` if every slot is taken.
    pub fn take_next_free(&self, codec: VideoCodec) -> Option<usize> {
        let _guard = self.alloc_lock.lock();
        for (idx, slot) in self.slots.iter().enumerate() {
            if !slot.enabled.load(Ordering::Acquire) {
                slot.codec.store(codec_to_u8(codec), Ordering::Release);
                slot.file_desc.store(0, Ordering::Release);
                slot.enabled.store(true, Ordering::Release);
                return Some(idx);
            }
        }
        None
    }

    /// Clears enable, codec, and file_desc. The caller must already have
    /// unbound/destroyed the channel on the HAL before calling this.
    pub fn destroy(&self, index: usize) {
        let _guard = self.alloc_lock.lock();
        if let Some(slot) = self.slots.get(index) {
            slot.enabled.store(false, Ordering::Release);
            slot.codec.store(0, Ordering::Release);
            slot.file_desc.store(0, Ordering::Release);
        }
    }

    pub fn set_file_desc(&self, index: usize, fd: u8) {
        if let Some(slot) = self.slots.get(index) {
            slot.file_desc.store(fd, Ordering::Release);
        }
    }

    pub fn is_enabled(&self, index: usize) -> bool {
        self.slots.get(index).map(|s| s.enabled.load(Ordering::Acquire)).unwrap_or(false)
    }

    pub fn info(&self, index: usize) -> Option<ChannelInfo> {
        let slot = self.slots.get(index)?;
        Some(ChannelInfo {
            enabled: slot.enabled.load(Ordering::Acquire),
            codec: codec_from_u8(slot.codec.load(Ordering::Acquire)),
            file_desc: slot.file_desc.load(Ordering::Acquire),
        })
    }

    pub fn enabled_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.enabled.load(Ordering::Acquire))
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_next_free_returns_lowest_index() {
        let reg = ChannelRegistry::new(4);
        assert_eq!(reg.take_next_free(VideoCodec::H264), Some(0));
        assert_eq!(reg.take_next_free(VideoCodec::H264), Some(1));
        reg.destroy(0);
        assert_eq!(reg.take_next_free(VideoCodec::H265), Some(0));
    }

    #[test]
    fn exhausted_registry_returns_none() {
        let reg = ChannelRegistry::new(1);
        assert_eq!(reg.take_next_free(VideoCodec::H264), Some(0));
        assert_eq!(reg.take_next_free(VideoCodec::H264), None);
    }

    #[test]
    fn destroyed_slot_reports_disabled() {
        let reg = ChannelRegistry::new(2);
        let idx = reg.take_next_free(VideoCodec::H265).unwrap();
        assert!(reg.is_enabled(idx));
        reg.destroy(idx);
        assert!(!reg.is_enabled(idx));
        assert_eq!(reg.info(idx).unwrap().enabled, false);
    }

    #[test]
    fn enabled_indices_subset_of_range() {
        let reg = ChannelRegistry::new(8);
        reg.take_next_free(VideoCodec::H264);
        reg.take_next_free(VideoCodec::H264);
        reg.take_next_free(VideoCodec::H264);
        reg.destroy(1);
        let enabled = reg.enabled_indices();
        assert_eq!(enabled, vec![0, 2]);
        assert!(enabled.iter().all(|&i| i < reg.capacity()));
    }
}
