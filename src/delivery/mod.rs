//! Delivery fan-out: the fixed-capacity HTTP streaming client table.
//!
//! Broadcasts are invoked directly from the video/audio capture threads, so
//! every send here is a blocking write guarded by one mutex over the whole
//! table — a single session-list lock generalized from one call's RTP
//! sessions to N HTTP sinks of four different wire formats.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::hal::{is_parameter_set, VideoCodec};
use crate::mp4::Mp4ClientState;

pub const MAX_CLIENTS: usize = 50;
/// After this many NALUs on one H26x connection, close it so the client can
/// reconnect and flush server buffers.
const H26X_NAL_LIMIT: u32 = 300;

pub enum SinkKind {
    /// `seen_param_set` gates delivery: a freshly registered client must not
    /// receive any NAL until the stream crosses a parameter-set/keyframe
    /// boundary, so it can decode from the first byte it gets.
    H26x { codec: VideoCodec, nal_counter: u32, seen_param_set: bool },
    Mp4 { state: Mp4ClientState, codec: VideoCodec, sent_init: bool },
    Mjpeg,
    Jpeg,
    Pcm,
}

pub struct ClientRow {
    pub channel: usize,
    pub stream: TcpStream,
    pub kind: SinkKind,
    pub alive: bool,
}

#[derive(Default)]
struct Counters {
    h26x: AtomicUsize,
    mp4: AtomicUsize,
    mjpeg: AtomicUsize,
    jpeg: AtomicUsize,
    pcm: AtomicUsize,
}

pub struct DeliveryTable {
    clients: Mutex<Vec<Option<ClientRow>>>,
    counters: Counters,
}

impl DeliveryTable {
    pub fn new() -> Self {
        let mut v = Vec::with_capacity(MAX_CLIENTS);
        v.resize_with(MAX_CLIENTS, || None);
        DeliveryTable { clients: Mutex::new(v), counters: Counters::default() }
    }

    /// Adds a client row to the first free slot. Returns `None` if the
    /// table is full.
    pub fn add(&self, row: ClientRow) -> Option<usize> {
        let mut guard = self.clients.lock();
        let slot = guard.iter().position(|c| c.is_none())?;
        match &row.kind {
            SinkKind::H26x { .. } => self.counters.h26x.fetch_add(1, Ordering::SeqCst),
            SinkKind::Mp4 { .. } => self.counters.mp4.fetch_add(1, Ordering::SeqCst),
            SinkKind::Mjpeg => self.counters.mjpeg.fetch_add(1, Ordering::SeqCst),
            SinkKind::Jpeg => self.counters.jpeg.fetch_add(1, Ordering::SeqCst),
            SinkKind::Pcm => self.counters.pcm.fetch_add(1, Ordering::SeqCst),
        };
        guard[slot] = Some(row);
        Some(slot)
    }

    fn remove_locked(guard: &mut Vec<Option<ClientRow>>, counters: &Counters, idx: usize) {
        if let Some(row) = guard[idx].take() {
            match row.kind {
                SinkKind::H26x { .. } => counters.h26x.fetch_sub(1, Ordering::SeqCst),
                SinkKind::Mp4 { .. } => counters.mp4.fetch_sub(1, Ordering::SeqCst),
                SinkKind::Mjpeg => counters.mjpeg.fetch_sub(1, Ordering::SeqCst),
                SinkKind::Jpeg => counters.jpeg.fetch_sub(1, Ordering::SeqCst),
                SinkKind::Pcm => counters.pcm.fetch_sub(1, Ordering::SeqCst),
            };
        }
    }

    pub fn remove(&self, idx: usize) {
        let mut guard = self.clients.lock();
        Self::remove_locked(&mut guard, &self.counters, idx);
    }

    /// Broadcasts H.264/H.265 NALUs for `channel` to every H26x client.
    /// Each NALU becomes one chunked-transfer record. A client that hasn't
    /// yet seen its first parameter set/keyframe has every other NAL
    /// skipped until one arrives, so it never starts mid-stream on data it
    /// can't decode. Drops any client whose write fails, and closes a
    /// client outright after [`H26X_NAL_LIMIT`] NALUs.
    pub fn send_h26x(&self, channel: usize, nalus: &[Vec<u8>]) {
        if self.counters.h26x.load(Ordering::SeqCst) == 0 {
            return;
        }
        let mut guard = self.clients.lock();
        let mut to_drop = Vec::new();
        for (idx, slot) in guard.iter_mut().enumerate() {
            let Some(row) = slot else { continue };
            if row.channel != channel || !row.alive {
                continue;
            }
            let SinkKind::H26x { codec, nal_counter, seen_param_set } = &mut row.kind else { continue };
            let codec = *codec;

            let mut failed = false;
            for nal in nalus {
                if !*seen_param_set {
                    if is_parameter_set(codec, nal) {
                        *seen_param_set = true;
                    } else {
                        continue;
                    }
                }
                if write_chunk(&mut row.stream, nal).is_err() {
                    failed = true;
                    break;
                }
                *nal_counter += 1;
            }

            let exceeded = matches!(&row.kind, SinkKind::H26x { nal_counter, .. } if *nal_counter >= H26X_NAL_LIMIT);
            if failed {
                to_drop.push(idx);
            } else if exceeded {
                let _ = write_final_chunk(&mut row.stream);
                to_drop.push(idx);
            }
        }
        for idx in to_drop {
            Self::remove_locked(&mut guard, &self.counters, idx);
        }
    }

    /// Broadcasts one completed MP4 fragment (or the init segment, once per
    /// client) to every MP4 client on `channel`.
    pub fn send_mp4(
        &self,
        channel: usize,
        get_init: impl Fn() -> Vec<u8>,
        get_moof_mdat: impl Fn(&mut Mp4ClientState, VideoCodec) -> (Vec<u8>, Vec<u8>),
    ) {
        if self.counters.mp4.load(Ordering::SeqCst) == 0 {
            return;
        }
        let mut guard = self.clients.lock();
        let mut to_drop = Vec::new();
        for (idx, slot) in guard.iter_mut().enumerate() {
            let Some(row) = slot else { continue };
            if row.channel != channel || !row.alive {
                continue;
            }
            let SinkKind::Mp4 { state, codec, sent_init } = &mut row.kind else { continue };

            let mut failed = false;
            if !*sent_init {
                let init = get_init();
                if write_chunk(&mut row.stream, &init).is_err() {
                    failed = true;
                } else {
                    *sent_init = true;
                }
            }
            if !failed {
                let (moof, mdat) = get_moof_mdat(state, *codec);
                if write_chunk(&mut row.stream, &moof).is_err() || write_chunk(&mut row.stream, &mdat).is_err() {
                    failed = true;
                }
            }
            if failed {
                to_drop.push(idx);
            }
        }
        for idx in to_drop {
            Self::remove_locked(&mut guard, &self.counters, idx);
        }
    }

    pub fn send_mjpeg(&self, channel: usize, jpeg: &[u8]) {
        if self.counters.mjpeg.load(Ordering::SeqCst) == 0 {
            return;
        }
        let mut guard = self.clients.lock();
        let mut to_drop = Vec::new();
        for (idx, slot) in guard.iter_mut().enumerate() {
            let Some(row) = slot else { continue };
            if row.channel != channel || !row.alive || !matches!(row.kind, SinkKind::Mjpeg) {
                continue;
            }
            let part = format!(
                "--boundarydonotcross\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                jpeg.len()
            );
            let ok = row.stream.write_all(part.as_bytes()).is_ok()
                && row.stream.write_all(jpeg).is_ok()
                && row.stream.write_all(b"\r\n").is_ok();
            if !ok {
                to_drop.push(idx);
            }
        }
        for idx in to_drop {
            Self::remove_locked(&mut guard, &self.counters, idx);
        }
    }

    /// Sends one-shot JPEG to the matching `Jpeg` client and closes it.
    pub fn send_jpeg(&self, channel: usize, jpeg: &[u8]) {
        if self.counters.jpeg.load(Ordering::SeqCst) == 0 {
            return;
        }
        let mut guard = self.clients.lock();
        let mut to_drop = Vec::new();
        for (idx, slot) in guard.iter_mut().enumerate() {
            let Some(row) = slot else { continue };
            if row.channel != channel || !row.alive || !matches!(row.kind, SinkKind::Jpeg) {
                continue;
            }
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                jpeg.len()
            );
            let _ = row.stream.write_all(header.as_bytes());
            let _ = row.stream.write_all(jpeg);
            to_drop.push(idx);
        }
        for idx in to_drop {
            Self::remove_locked(&mut guard, &self.counters, idx);
        }
    }

    pub fn send_pcm(&self, channel: usize, pcm_bytes: &[u8]) {
        if self.counters.pcm.load(Ordering::SeqCst) == 0 {
            return;
        }
        let mut guard = self.clients.lock();
        let mut to_drop = Vec::new();
        for (idx, slot) in guard.iter_mut().enumerate() {
            let Some(row) = slot else { continue };
            if row.channel != channel || !row.alive || !matches!(row.kind, SinkKind::Pcm) {
                continue;
            }
            if write_chunk(&mut row.stream, pcm_bytes).is_err() {
                to_drop.push(idx);
            }
        }
        for idx in to_drop {
            Self::remove_locked(&mut guard, &self.counters, idx);
        }
    }
}

impl Default for DeliveryTable {
    fn default() -> Self {
        Self::new()
    }
}

fn write_chunk(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    write!(stream, "{:x}\r\n", payload.len())?;
    stream.write_all(payload)?;
    stream.write_all(b"\r\n")?;
    Ok(())
}

fn write_final_chunk(stream: &mut TcpStream) -> std::io::Result<()> {
    stream.write_all(b"0\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_capacity_is_bounded() {
        let table = DeliveryTable::new();
        assert_eq!(table.clients.lock().len(), MAX_CLIENTS);
    }
}
