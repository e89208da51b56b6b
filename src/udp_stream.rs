//! UDP NALU streamer: fire-and-forget fan-out to a list of `udp://host:port`
//! destinations, unicast or multicast, with no reliability or retry.
//!
//! Destinations are sent over a plain `std::net::UdpSocket` on a blocking OS
//! thread rather than an async runtime's socket — every worker loop in this
//! crate is a blocking OS thread, and this one is no exception.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};

use crate::hal::VideoCodec;

/// Datagrams larger than this are fragmented.
const MTU: usize = 1400;
/// codec flag + fragment flag + 2-byte sequence.
const FRAGMENT_HEADER_SIZE: usize = 4;

const FRAG_START: u8 = 0b0000_0001;
const FRAG_MIDDLE: u8 = 0b0000_0010;
const FRAG_END: u8 = 0b0000_0100;
const FRAG_KEYFRAME: u8 = 0b1000_0000;

fn codec_flag(codec: VideoCodec) -> u8 {
    match codec {
        VideoCodec::H264 => 0,
        VideoCodec::H265 => 1,
    }
}

/// Parses a `udp://host[:port]` destination string, defaulting to 5000 when
/// no port is given.
pub fn parse_destination(dest: &str) -> Option<SocketAddr> {
    let rest = dest.strip_prefix("udp://")?;
    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) => (h, p.parse().ok()?),
        None => (rest, 5000u16),
    };
    (host, port).to_socket_addrs().ok()?.next()
}

pub fn is_multicast(addr: &SocketAddr) -> bool {
    match addr.ip() {
        std::net::IpAddr::V4(v4) => (v4.octets()[0] & 0xf0) == 0xe0 || Ipv4Addr::from(v4).is_multicast(),
        std::net::IpAddr::V6(v6) => v6.is_multicast(),
    }
}

pub struct UdpStreamer {
    socket: UdpSocket,
    destinations: Vec<SocketAddr>,
    sequence: AtomicU16,
}

impl UdpStreamer {
    pub fn new(src_port: u16, destinations: Vec<SocketAddr>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", src_port))?;
        Ok(UdpStreamer { socket, destinations, sequence: AtomicU16::new(0) })
    }

    pub fn add_destination(&mut self, addr: SocketAddr) {
        self.destinations.push(addr);
    }

    /// Sends one NALU to every destination, fragmenting when it exceeds the
    /// MTU. Send failures are swallowed; there is no retry.
    pub fn send_nal(&self, codec: VideoCodec, nal: &[u8], is_keyframe: bool) {
        if self.destinations.is_empty() || nal.is_empty() {
            return;
        }
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let flag = codec_flag(codec);

        if nal.len() + FRAGMENT_HEADER_SIZE <= MTU {
            let packet = build_fragment(flag, FRAG_START | FRAG_END, is_keyframe, seq, nal);
            self.broadcast(&packet);
            return;
        }

        let chunk_size = MTU - FRAGMENT_HEADER_SIZE;
        let mut offset = 0;
        let mut first = true;
        while offset < nal.len() {
            let end = (offset + chunk_size).min(nal.len());
            let is_last = end == nal.len();
            let frag_flag = if first {
                FRAG_START
            } else if is_last {
                FRAG_END
            } else {
                FRAG_MIDDLE
            };
            let packet = build_fragment(flag, frag_flag, is_keyframe, seq, &nal[offset..end]);
            self.broadcast(&packet);
            offset = end;
            first = false;
        }
    }

    fn broadcast(&self, packet: &[u8]) {
        for dest in &self.destinations {
            let _ = self.socket.send_to(packet, dest);
        }
    }
}

fn build_fragment(codec_flag: u8, frag_flag: u8, is_keyframe: bool, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut flag = frag_flag;
    if is_keyframe {
        flag |= FRAG_KEYFRAME;
    }
    let mut out = Vec::with_capacity(FRAGMENT_HEADER_SIZE + payload.len());
    out.push(codec_flag);
    out.push(flag);
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_destination_with_explicit_port() {
        let addr = parse_destination("udp://127.0.0.1:6000").unwrap();
        assert_eq!(addr.port(), 6000);
    }

    #[test]
    fn parses_destination_with_default_port() {
        let addr = parse_destination("udp://127.0.0.1").unwrap();
        assert_eq!(addr.port(), 5000);
    }

    #[test]
    fn detects_multicast_range() {
        let addr: SocketAddr = "239.1.1.1:5000".parse().unwrap();
        assert!(is_multicast(&addr));
        let addr: SocketAddr = "192.168.1.1:5000".parse().unwrap();
        assert!(!is_multicast(&addr));
    }

    #[test]
    fn small_nal_sends_single_start_end_fragment() {
        let streamer = UdpStreamer::new(0, vec!["127.0.0.1:9999".parse().unwrap()]).unwrap();
        streamer.send_nal(VideoCodec::H264, &[0x67, 1, 2, 3], true);
        assert_eq!(streamer.sequence.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn large_nal_fragments_across_multiple_datagrams() {
        let nal = vec![0xaau8; MTU * 2];
        let flag = FRAG_START;
        assert_ne!(flag & FRAG_MIDDLE, FRAG_MIDDLE);
        let packet = build_fragment(0, FRAG_START, true, 7, &nal[..10]);
        assert_eq!(packet[0], 0);
        assert_eq!(packet[1], FRAG_START | FRAG_KEYFRAME);
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 7);
    }
}
