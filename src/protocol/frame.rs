//! The frame header codec (§4.1). Grounded on the teacher's
//! `protocol/packet.rs`: a `#[repr(C, packed)]` zero-copy header struct plus
//! a `tokio_util::codec::Decoder` that accumulates exactly one frame's worth
//! of bytes before handing it to the caller (the teacher does the same for
//! MySQL's 4-byte length-prefixed packets; ours additionally varies header
//! width by negotiated protocol version).

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use zerocopy::byteorder::big_endian::{U16 as U16BE, U32 as U32BE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::flags::HeaderFlags;
use super::opcode::Opcode;
use super::version::ProtocolVersion;
use crate::error::{Error, Result};

const RESPONSE_BIT: u8 = 0x80;

/// A decoded frame header (§3, §4.1).
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    pub is_response: bool,
    pub flags: HeaderFlags,
    pub stream: i16,
    pub opcode: Opcode,
    pub body_len: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RawHeaderWide {
    version: u8,
    flags: u8,
    stream: U16BE,
    opcode: u8,
    body_len: U32BE,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RawHeaderNarrow {
    version: u8,
    flags: u8,
    stream: u8,
    opcode: u8,
    body_len: U32BE,
}

fn malformed(what: &str) -> Error {
    Error::ProtocolError(format!("malformed frame: {what}"))
}

impl FrameHeader {
    /// Decode a header whose width is inferred from the version byte alone
    /// (used during handshake, before a version has been fully negotiated).
    pub fn peek_version(data: &[u8]) -> Result<ProtocolVersion> {
        if data.is_empty() {
            return Err(malformed("empty header"));
        }
        let raw_version = data[0] & !RESPONSE_BIT;
        ProtocolVersion::from_raw(raw_version)
            .ok_or_else(|| malformed("unsupported protocol version in header"))
    }

    pub fn decode(data: &[u8], negotiated: ProtocolVersion) -> Result<Self> {
        if negotiated.stream_id_width() == 1 {
            let raw = RawHeaderNarrow::ref_from_bytes(&data[..8])
                .map_err(|_| malformed("header truncated"))?;
            Self::from_narrow(raw)
        } else {
            let raw = RawHeaderWide::ref_from_bytes(&data[..9])
                .map_err(|_| malformed("header truncated"))?;
            Self::from_wide(raw)
        }
    }

    fn from_narrow(raw: &RawHeaderNarrow) -> Result<Self> {
        let is_response = raw.version & RESPONSE_BIT != 0;
        let version = ProtocolVersion::from_raw(raw.version & !RESPONSE_BIT)
            .ok_or_else(|| malformed("unsupported protocol version"))?;
        Ok(Self {
            version,
            is_response,
            flags: HeaderFlags::from_bits_retain(raw.flags),
            stream: raw.stream as i8 as i16,
            opcode: Opcode::from_byte(raw.opcode)?,
            body_len: raw.body_len.get(),
        })
    }

    fn from_wide(raw: &RawHeaderWide) -> Result<Self> {
        let is_response = raw.version & RESPONSE_BIT != 0;
        let version = ProtocolVersion::from_raw(raw.version & !RESPONSE_BIT)
            .ok_or_else(|| malformed("unsupported protocol version"))?;
        Ok(Self {
            version,
            is_response,
            flags: HeaderFlags::from_bits_retain(raw.flags),
            stream: raw.stream.get() as i16,
            opcode: Opcode::from_byte(raw.opcode)?,
            body_len: raw.body_len.get(),
        })
    }

    pub fn encode(
        out: &mut Vec<u8>,
        version: ProtocolVersion,
        flags: HeaderFlags,
        stream: i16,
        opcode: Opcode,
        body_len: u32,
    ) {
        out.push(version.raw());
        out.push(flags.bits());
        if version.stream_id_width() == 1 {
            out.push(stream as i8 as u8);
        } else {
            out.extend_from_slice(&(stream as u16).to_be_bytes());
        }
        out.push(opcode as u8);
        out.extend_from_slice(&body_len.to_be_bytes());
    }
}

/// Streaming frame decoder: accumulates bytes until a full frame
/// (`header_len + body_len`) is available, then slices exactly one frame
/// and leaves the remainder buffered for the next call (§4.4).
pub struct FrameDecoder {
    version: ProtocolVersion,
    state: DecoderState,
}

enum DecoderState {
    ReadingHeader,
    ReadingBody { header: FrameHeader },
}

impl FrameDecoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            state: DecoderState::ReadingHeader,
        }
    }

    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }
}

impl Decoder for FrameDecoder {
    type Item = (FrameHeader, BytesMut);
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match &self.state {
                DecoderState::ReadingHeader => {
                    let header_len = self.version.header_len();
                    if src.len() < header_len {
                        return Ok(None);
                    }
                    let header = FrameHeader::decode(&src[..header_len], self.version)?;
                    src.advance(header_len);
                    self.state = DecoderState::ReadingBody { header };
                }
                DecoderState::ReadingBody { header } => {
                    let body_len = header.body_len as usize;
                    if src.len() < body_len {
                        return Ok(None);
                    }
                    let body = src.split_to(body_len);
                    let header = *header;
                    self.state = DecoderState::ReadingHeader;
                    return Ok(Some((header, body)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn encodes_and_decodes_v3_header() {
        let mut buf = Vec::new();
        FrameHeader::encode(
            &mut buf,
            ProtocolVersion::V3,
            HeaderFlags::TRACING,
            7,
            Opcode::Query,
            42,
        );
        assert_eq!(buf.len(), 9);
        let header = FrameHeader::decode(&buf, ProtocolVersion::V3).unwrap();
        assert_eq!(header.stream, 7);
        assert_eq!(header.body_len, 42);
        assert!(!header.is_response);
        assert_eq!(header.flags, HeaderFlags::TRACING);
    }

    #[test]
    fn v1_header_is_8_bytes_with_signed_stream() {
        let mut buf = Vec::new();
        FrameHeader::encode(
            &mut buf,
            ProtocolVersion::V1,
            HeaderFlags::empty(),
            -1,
            Opcode::Event,
            0,
        );
        assert_eq!(buf.len(), 8);
        let header = FrameHeader::decode(&buf, ProtocolVersion::V1).unwrap();
        assert_eq!(header.stream, -1);
    }

    #[test]
    fn response_bit_is_decoded() {
        let mut buf = Vec::new();
        buf.push(ProtocolVersion::V4.raw() | RESPONSE_BIT);
        buf.push(0);
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.push(Opcode::Result as u8);
        buf.extend_from_slice(&0u32.to_be_bytes());
        let header = FrameHeader::decode(&buf, ProtocolVersion::V4).unwrap();
        assert!(header.is_response);
    }

    #[test]
    fn decoder_waits_for_full_frame_across_chunks() {
        let mut frame = Vec::new();
        FrameHeader::encode(
            &mut frame,
            ProtocolVersion::V4,
            HeaderFlags::empty(),
            3,
            Opcode::Result,
            4,
        );
        frame.extend_from_slice(&[1, 2, 3, 4]);

        let mut decoder = FrameDecoder::new(ProtocolVersion::V4);
        let mut buf = BytesMut::from(&frame[..5]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[5..]);
        let (header, body) = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(header.stream, 3);
        assert_eq!(&body[..], &[1, 2, 3, 4]);
    }
}
