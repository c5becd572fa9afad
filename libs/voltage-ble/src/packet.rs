//! Packet fragmentation
//!
//! Wire frame: `Prefix || index (u16 BE) || total (u16 BE) || payload || Suffix`.
//! `MaxPayload` is always derived from the concrete frame layout.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::command;
use crate::error::{BleError, Result};

/// Largest frame the notify channel accepts
pub const DEFAULT_MTU: usize = 247;
/// 2-byte index + 2-byte total
pub const HEADER_SIZE: usize = 4;
/// Frame suffix
pub const SUFFIX: &str = "\r\n";
/// Notify handle used by the default GATT characteristic
pub const DEFAULT_NOTIFY_HANDLE: &str = "fff2";

/// One fragment of a logical message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub index: u16,
    pub total: u16,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(index: u16, total: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            index,
            total,
            payload: payload.into(),
        }
    }
}

/// Concrete frame layout for one deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFormat {
    mtu: usize,
    prefix: String,
    suffix: String,
    max_payload: usize,
}

impl FrameFormat {
    /// Layout with the standard `\r\n` suffix
    pub fn new(mtu: usize, prefix: impl Into<String>) -> Result<Self> {
        Self::with_suffix(mtu, prefix, SUFFIX)
    }

    /// Layout with an explicit suffix; fails fast when no payload byte fits
    pub fn with_suffix(
        mtu: usize,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix.into();
        let suffix = suffix.into();
        if suffix.is_empty() {
            return Err(BleError::frame_config("frame suffix must not be empty"));
        }
        let overhead = prefix.len() + suffix.len() + HEADER_SIZE;
        let max_payload = mtu.saturating_sub(overhead);
        if max_payload < 1 {
            return Err(BleError::frame_config(format!(
                "MTU {} leaves no payload room (prefix {} + suffix {} + header {})",
                mtu,
                prefix.len(),
                suffix.len(),
                HEADER_SIZE
            )));
        }
        Ok(Self {
            mtu,
            prefix,
            suffix,
            max_payload,
        })
    }

    /// Layout for GATT notifications on `handle`
    pub fn notify(mtu: usize, handle: &str) -> Result<Self> {
        Self::new(mtu, command::notify_prefix(handle)?)
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// `MTU - len(Prefix) - len(Suffix) - HeaderSize`
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Split `data` into `ceil(len / MaxPayload)` packets
    pub fn split(&self, data: &[u8]) -> Result<Vec<Packet>> {
        let count = data.len().div_ceil(self.max_payload);
        let total = u16::try_from(count).map_err(|_| BleError::TooManyPackets(count))?;

        let packets: Vec<Packet> = data
            .chunks(self.max_payload)
            .enumerate()
            .map(|(i, chunk)| Packet::new(i as u16, total, Bytes::copy_from_slice(chunk)))
            .collect();

        debug!(
            "[Packet] split {} bytes into {} packets (max payload {})",
            data.len(),
            packets.len(),
            self.max_payload
        );
        Ok(packets)
    }

    /// Build the wire frame for `packet`
    pub fn encode(&self, packet: &Packet) -> Bytes {
        let mut frame = BytesMut::with_capacity(
            self.prefix.len() + HEADER_SIZE + packet.payload.len() + self.suffix.len(),
        );
        frame.put_slice(self.prefix.as_bytes());
        frame.put_u16(packet.index);
        frame.put_u16(packet.total);
        frame.put_slice(&packet.payload);
        frame.put_slice(self.suffix.as_bytes());
        frame.freeze()
    }

    /// Parse a wire frame; prefix and suffix are optional on input
    pub fn decode(&self, frame: &[u8]) -> Result<Packet> {
        let body = frame.strip_prefix(self.prefix.as_bytes()).unwrap_or(frame);
        let body = body.strip_suffix(self.suffix.as_bytes()).unwrap_or(body);
        parse_packet(body)
    }
}

/// Parse `index || total || payload`
pub fn parse_packet(body: &[u8]) -> Result<Packet> {
    if body.len() < HEADER_SIZE {
        return Err(BleError::invalid_frame(format!(
            "frame of {} bytes is shorter than the {}-byte header",
            body.len(),
            HEADER_SIZE
        )));
    }
    let index = u16::from_be_bytes([body[0], body[1]]);
    let total = u16::from_be_bytes([body[2], body[3]]);
    Ok(Packet::new(
        index,
        total,
        Bytes::copy_from_slice(&body[HEADER_SIZE..]),
    ))
}

/// Rebuild a message from a complete packet set delivered in any order
pub fn reassemble_packets(packets: impl IntoIterator<Item = Packet>) -> Result<Vec<u8>> {
    let mut slots: Vec<Option<Bytes>> = Vec::new();
    let mut expected: Option<u16> = None;

    for packet in packets {
        let total = *expected.get_or_insert(packet.total);
        if packet.total != total {
            return Err(BleError::invalid_frame(format!(
                "packet {} reports total {}, expected {}",
                packet.index, packet.total, total
            )));
        }
        if packet.index >= total {
            return Err(BleError::invalid_frame(format!(
                "packet index {} outside 0..{}",
                packet.index, total
            )));
        }
        if slots.is_empty() {
            slots.resize(total as usize, None);
        }
        slots[packet.index as usize].get_or_insert(packet.payload);
    }

    let total = expected.unwrap_or(0);
    let mut data = Vec::new();
    for (index, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(payload) => data.extend_from_slice(&payload),
            None => {
                return Err(BleError::MissingPacket {
                    index: index as u16,
                    total,
                })
            },
        }
    }
    Ok(data)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn format_with_prefix_len(len: usize) -> FrameFormat {
        FrameFormat::new(DEFAULT_MTU, "P".repeat(len)).unwrap()
    }

    #[test]
    fn test_max_payload_is_derived() {
        let format = format_with_prefix_len(25);
        assert_eq!(format.max_payload(), 216);

        let notify = FrameFormat::notify(DEFAULT_MTU, DEFAULT_NOTIFY_HANDLE).unwrap();
        assert_eq!(notify.prefix(), "AT+QBLEGATTSNTFY=0,fff2,");
        assert_eq!(notify.max_payload(), 247 - 24 - 2 - 4);
    }

    #[test]
    fn test_frame_config_rejected_without_payload_room() {
        assert!(matches!(
            FrameFormat::new(10, "ABCD"),
            Err(BleError::FrameConfig(_))
        ));
        // exactly one payload byte is enough
        assert_eq!(FrameFormat::new(11, "ABCD").unwrap().max_payload(), 1);
        assert!(FrameFormat::with_suffix(247, "X", "").is_err());
    }

    #[test]
    fn test_split_500_bytes() {
        let format = format_with_prefix_len(25);
        let data = vec![b'a'; 500];
        let packets = format.split(&data).unwrap();

        assert_eq!(packets.len(), 3);
        let lens: Vec<usize> = packets.iter().map(|p| p.payload.len()).collect();
        assert_eq!(lens, vec![216, 216, 68]);
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.index as usize, i);
            assert_eq!(p.total, 3);
        }
    }

    #[test]
    fn test_split_exact_multiple_and_empty() {
        let format = format_with_prefix_len(25);
        let packets = format.split(&[7u8; 432]).unwrap();
        assert_eq!(packets.len(), 2);
        assert!(packets.iter().all(|p| p.payload.len() == 216));

        assert!(format.split(&[]).unwrap().is_empty());
        assert_eq!(reassemble_packets(Vec::new()).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_encode_layout() {
        let format = FrameFormat::new(DEFAULT_MTU, "AT+X=").unwrap();
        let frame = format.encode(&Packet::new(1, 258, &b"{}"[..]));
        assert_eq!(&frame[..5], b"AT+X=");
        assert_eq!(&frame[5..9], &[0x00, 0x01, 0x01, 0x02]);
        assert_eq!(&frame[9..11], b"{}");
        assert_eq!(&frame[11..], b"\r\n");
        assert!(frame.len() <= format.mtu());
    }

    #[test]
    fn test_decode_with_and_without_prefix() {
        let format = FrameFormat::new(DEFAULT_MTU, "AT+X=").unwrap();
        let packet = Packet::new(2, 3, &b"tail"[..]);
        let frame = format.encode(&packet);
        assert_eq!(format.decode(&frame).unwrap(), packet);
        assert_eq!(format.decode(&frame[5..]).unwrap(), packet);
        assert!(matches!(
            format.decode(b"AT+X=\x00\x01"),
            Err(BleError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_reassemble_out_of_order() {
        let format = format_with_prefix_len(25);
        let data: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        let mut packets = format.split(&data).unwrap();
        let order = [2usize, 0, 1];
        let shuffled: Vec<Packet> = order.iter().map(|&i| packets[i].clone()).collect();
        assert_eq!(reassemble_packets(shuffled).unwrap(), data);

        packets.remove(1);
        assert_eq!(
            reassemble_packets(packets),
            Err(BleError::MissingPacket { index: 1, total: 3 })
        );
    }

    #[test]
    fn test_reassemble_rejects_inconsistent_totals() {
        let packets = vec![Packet::new(0, 2, &b"a"[..]), Packet::new(1, 3, &b"b"[..])];
        assert!(matches!(
            reassemble_packets(packets),
            Err(BleError::InvalidFrame(_))
        ));
        let packets = vec![Packet::new(5, 2, &b"a"[..])];
        assert!(reassemble_packets(packets).is_err());
    }
}
