//! Socket wire framing.
//!
//! Each frame on the wire is a packed 44-byte header followed by
//! `float_count * 4` payload bytes. Multi-byte fields are little-endian (the
//! reference platforms are little-endian; the shared-memory layout makes the
//! same assumption).
//!
//! ```text
//! magic[4] = "CALD"   version:u16 = 1   header_bytes:u16 = 44
//! frame_id:u64        timestamp_ns:u64
//! width:u32  height:u32  float_count:u32
//! checksum:u32  checksum_algorithm:u32
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::WorldFrame;

pub const WIRE_MAGIC: [u8; 4] = *b"CALD";
pub const WIRE_VERSION: u16 = 1;
pub const WIRE_HEADER_BYTES: usize = 44;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WireHeader {
    pub frame_id: u64,
    pub timestamp_ns: u64,
    pub width: u32,
    pub height: u32,
    pub float_count: u32,
    pub checksum: u32,
    pub checksum_algorithm: u32,
}

impl WireHeader {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(WIRE_HEADER_BYTES);
        buf.put_slice(&WIRE_MAGIC);
        buf.put_u16_le(WIRE_VERSION);
        buf.put_u16_le(WIRE_HEADER_BYTES as u16);
        buf.put_u64_le(self.frame_id);
        buf.put_u64_le(self.timestamp_ns);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.float_count);
        buf.put_u32_le(self.checksum);
        buf.put_u32_le(self.checksum_algorithm);
    }

    /// Decode and validate a header. `None` on bad magic, wrong version, or
    /// an unexpected header size.
    pub fn decode(bytes: &[u8; WIRE_HEADER_BYTES]) -> Option<Self> {
        if bytes[0..4] != WIRE_MAGIC {
            return None;
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        let header_bytes = u16::from_le_bytes([bytes[6], bytes[7]]);
        if version != WIRE_VERSION || header_bytes as usize != WIRE_HEADER_BYTES {
            return None;
        }
        Some(Self {
            frame_id: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            timestamp_ns: u64::from_le_bytes(bytes[16..24].try_into().ok()?),
            width: u32::from_le_bytes(bytes[24..28].try_into().ok()?),
            height: u32::from_le_bytes(bytes[28..32].try_into().ok()?),
            float_count: u32::from_le_bytes(bytes[32..36].try_into().ok()?),
            checksum: u32::from_le_bytes(bytes[36..40].try_into().ok()?),
            checksum_algorithm: u32::from_le_bytes(bytes[40..44].try_into().ok()?),
        })
    }
}

/// Encode one frame (header + payload) ready for the stream.
pub fn encode_frame(frame: &WorldFrame, checksum: u32, checksum_algorithm: u32) -> Bytes {
    let payload_bytes = frame.height_map.data.len() * std::mem::size_of::<f32>();
    let mut buf = BytesMut::with_capacity(WIRE_HEADER_BYTES + payload_bytes);
    WireHeader {
        frame_id: frame.frame_id,
        timestamp_ns: frame.timestamp_ns,
        width: frame.height_map.width,
        height: frame.height_map.height,
        float_count: frame.height_map.data.len() as u32,
        checksum,
        checksum_algorithm,
    }
    .encode_into(&mut buf);
    for v in &frame.height_map.data {
        buf.put_f32_le(*v);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HeightMap;

    #[test]
    fn test_header_roundtrip() {
        let header = WireHeader {
            frame_id: 77,
            timestamp_ns: 123_456,
            width: 16,
            height: 9,
            float_count: 144,
            checksum: 0xABCD_EF01,
            checksum_algorithm: 1,
        };
        let mut buf = BytesMut::new();
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), WIRE_HEADER_BYTES);
        let decoded = WireHeader::decode(buf[..].try_into().unwrap()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        WireHeader::default().encode_into(&mut buf);
        let mut bytes: [u8; WIRE_HEADER_BYTES] = buf[..].try_into().unwrap();
        bytes[0] = b'X';
        assert!(WireHeader::decode(&bytes).is_none());
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let mut buf = BytesMut::new();
        WireHeader::default().encode_into(&mut buf);
        let mut bytes: [u8; WIRE_HEADER_BYTES] = buf[..].try_into().unwrap();
        bytes[4] = 9;
        assert!(WireHeader::decode(&bytes).is_none());
    }

    #[test]
    fn test_encode_frame_layout() {
        let frame = WorldFrame {
            frame_id: 3,
            timestamp_ns: 42,
            height_map: HeightMap {
                width: 2,
                height: 1,
                data: vec![1.5, -2.5],
            },
            checksum: 0,
            checksum_algorithm: 0,
        };
        let bytes = encode_frame(&frame, 0xBEEF, 1);
        assert_eq!(bytes.len(), WIRE_HEADER_BYTES + 8);
        let header = WireHeader::decode(bytes[..WIRE_HEADER_BYTES].try_into().unwrap()).unwrap();
        assert_eq!(header.frame_id, 3);
        assert_eq!(header.float_count, 2);
        assert_eq!(header.checksum, 0xBEEF);
        let first = f32::from_le_bytes(bytes[44..48].try_into().unwrap());
        assert_eq!(first, 1.5);
    }
}
