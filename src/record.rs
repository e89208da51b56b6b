//! Recording writer: consumes the same fragmented-MP4 stream as the HTTP
//! MP4 sink, but writes segments to disk with filename templating and
//! duration/size-based rotation.
//!
//! Grounded on `delivery::DeliveryTable`'s MP4 client bookkeeping — the
//! recorder keeps its own [`Mp4ClientState`] rather than sharing one with
//! broadcast clients. It shares the underlying [`Mp4Muxer`] (decoder config
//! and cached init segment only) with the broadcast path under a lock, but
//! never touches a broadcast client's own state.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Local;
use parking_lot::Mutex;

use crate::config::RecordConfig;
use crate::mp4::{Mp4ClientState, Mp4Muxer};

pub struct Recorder {
    config: RecordConfig,
    running: AtomicBool,
}

struct Segment {
    file: File,
    state: Mp4ClientState,
    started_at: Instant,
    bytes_written: u64,
}

impl Recorder {
    pub fn new(config: RecordConfig) -> Self {
        Recorder { config, running: AtomicBool::new(false) }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn segment_path(&self) -> PathBuf {
        let name = Local::now().format(&self.config.filename).to_string();
        PathBuf::from(&self.config.path).join(name)
    }

    fn open_segment(&self, muxer: &Mutex<Mp4Muxer>) -> std::io::Result<Segment> {
        let path = self.segment_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        let init = muxer.lock().get_init_segment().map_err(std::io::Error::other)?;
        file.write_all(&init)?;
        Ok(Segment { file, state: Mp4ClientState::default(), started_at: Instant::now(), bytes_written: init.len() as u64 })
    }

    fn needs_rotation(&self, segment: &Segment) -> bool {
        let duration_exceeded =
            self.config.segment_duration > 0 && segment.started_at.elapsed().as_secs() >= self.config.segment_duration as u64;
        let size_exceeded = self.config.segment_size > 0 && segment.bytes_written >= self.config.segment_size;
        duration_exceeded || size_exceeded
    }

    /// Runs the recorder loop on the calling thread (the caller spawns a
    /// dedicated thread for this). `muxer` is the same instance the
    /// broadcast MP4 sink ingests frames into, shared under a lock so its
    /// decoder config (sps/pps) and cached init segment stay current
    /// without the recorder ever touching a broadcast client's state.
    /// `next_group` blocks until the next completed video access-unit group
    /// is ready, returning `(nalus, is_keyframe, duration_90k)`; it returns
    /// `None` on shutdown.
    pub fn run(
        &self,
        muxer: &Mutex<Mp4Muxer>,
        mut next_group: impl FnMut() -> Option<(Vec<Vec<u8>>, bool, u32)>,
    ) {
        let mut segment = match self.open_segment(muxer) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "recorder: failed to open initial segment");
                return;
            }
        };

        while self.running.load(Ordering::SeqCst) {
            let Some((nalus, is_keyframe, duration_90k)) = next_group() else { break };
            let (moof, mdat) = {
                let muxer = muxer.lock();
                let moof = muxer.get_moof(&mut segment.state, &nalus, is_keyframe, duration_90k);
                let mdat = muxer.get_mdat(&mut segment.state, &nalus);
                (moof, mdat)
            };

            if write_best_effort(&mut segment.file, &moof).is_err() || write_best_effort(&mut segment.file, &mdat).is_err() {
                // ENOSPC or similar: keep the process alive, skip this
                // fragment, and let the next rotation attempt a fresh file.
                tracing::warn!("recorder: write failed, dropping fragment (possible ENOSPC)");
                continue;
            }
            segment.bytes_written += (moof.len() + mdat.len()) as u64;

            if self.needs_rotation(&segment) {
                let _ = segment.file.sync_all();
                match self.open_segment(muxer) {
                    Ok(new_segment) => segment = new_segment,
                    Err(e) => {
                        tracing::error!(error = %e, "recorder: failed to rotate segment, continuing with current file");
                    }
                }
            }
        }
        let _ = segment.file.sync_all();
    }
}

fn write_best_effort(file: &mut File, data: &[u8]) -> std::io::Result<()> {
    file.write_all(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_triggers_on_duration() {
        let config = RecordConfig { segment_duration: 0, segment_size: 0, ..RecordConfig::default() };
        let recorder = Recorder::new(config);
        let segment = Segment { file: tempfile(), state: Mp4ClientState::default(), started_at: Instant::now(), bytes_written: 0 };
        assert!(!recorder.needs_rotation(&segment));
    }

    #[test]
    fn rotation_triggers_on_size() {
        let config = RecordConfig { segment_duration: 0, segment_size: 100, ..RecordConfig::default() };
        let recorder = Recorder::new(config);
        let segment = Segment { file: tempfile(), state: Mp4ClientState::default(), started_at: Instant::now(), bytes_written: 200 };
        assert!(recorder.needs_rotation(&segment));
    }

    fn tempfile() -> File {
        File::create(std::env::temp_dir().join(format!("camerad-record-test-{:?}", std::thread::current().id()))).unwrap()
    }
}
