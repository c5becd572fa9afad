//! Frame codec for byte streams carrying fragmented packets
//!
//! Frames are located by prefix, then the fixed 4-byte header, then the
//! payload up to the suffix. Header bytes may contain any value, including
//! `\r` and `\n`, so frames are never split on line breaks.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::error::BleError;
use crate::packet::{parse_packet, FrameFormat, Packet, HEADER_SIZE};

/// Decodes wire frames into packets, encodes packets into wire frames
#[derive(Debug, Clone)]
pub struct PacketCodec {
    format: FrameFormat,
}

impl PacketCodec {
    pub fn new(format: FrameFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = BleError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, BleError> {
        let prefix_len = self.format.prefix().len();
        let suffix_len = self.format.suffix().len();

        loop {
            if prefix_len > 0 {
                match find(src, self.format.prefix().as_bytes()) {
                    Some(0) => {},
                    Some(pos) => {
                        debug!("[PacketCodec] skipping {} bytes before prefix", pos);
                        src.advance(pos);
                    },
                    None => {
                        // keep a possible partial prefix at the tail
                        let keep = prefix_len - 1;
                        if src.len() > keep {
                            let skip = src.len() - keep;
                            src.advance(skip);
                        }
                        return Ok(None);
                    },
                }
            }

            let body_start = prefix_len + HEADER_SIZE;
            if src.len() < body_start {
                return Ok(None);
            }

            match find(&src[body_start..], self.format.suffix().as_bytes()) {
                Some(end) => {
                    let frame = src.split_to(body_start + end + suffix_len);
                    let body = &frame[prefix_len..frame.len() - suffix_len];
                    return parse_packet(body).map(Some);
                },
                None if src.len() > self.format.mtu() => {
                    warn!(
                        "[PacketCodec] no suffix within MTU {}, dropping frame start",
                        self.format.mtu()
                    );
                    src.advance(body_start);
                },
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = BleError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), BleError> {
        dst.extend_from_slice(&self.format.encode(&packet));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::packet::DEFAULT_MTU;

    fn codec() -> PacketCodec {
        PacketCodec::new(FrameFormat::new(DEFAULT_MTU, "AT+N=").unwrap())
    }

    #[test]
    fn test_decode_header_with_line_break_bytes() {
        let mut codec = codec();
        // index 10 = 0x000A, total 13 = 0x000D
        let packet = Packet::new(10, 13, &b"{\"a\":1}"[..]);
        let mut buf = BytesMut::from(&codec.format().encode(&packet)[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(packet));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = codec();
        let frame = codec.format().encode(&Packet::new(0, 1, &b"[1,2,3]"[..]));
        let mut buf = BytesMut::from(&frame[..8]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&frame[8..]);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&packet.payload[..], b"[1,2,3]");
    }

    #[test]
    fn test_decode_skips_noise_and_reads_consecutive_frames() {
        let mut codec = codec();
        let a = codec.format().encode(&Packet::new(0, 2, &b"ab"[..]));
        let b = codec.format().encode(&Packet::new(1, 2, &b"cd"[..]));
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"OK\r\nnoise");
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().index, 0);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().index, 1);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_encode_matches_format() {
        let mut codec = codec();
        let packet = Packet::new(3, 4, &b"zz"[..]);
        let mut dst = BytesMut::new();
        codec.encode(packet.clone(), &mut dst).unwrap();
        assert_eq!(&dst[..], &codec.format().encode(&packet)[..]);
    }
}
