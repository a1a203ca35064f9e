//! Binary codec: primitive readers and writers plus packet framing.
//!
//! All multi-byte integers are big-endian. Reads verify availability before
//! advancing and fail with an end-of-buffer error; writes go into a growable
//! buffer and cannot fail.

use byteorder::{BigEndian, ReadBytesExt};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use std::io::{Cursor, Read};
use uuid::Uuid;

use super::{
    BitchatPacket, FLAG_PAYLOAD_COMPRESSED, FLAG_RECIPIENT_PRESENT, FLAG_SIGNATURE_PRESENT,
    HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION, RECIPIENT_ID_SIZE, SENDER_ID_SIZE,
    SIGNATURE_SIZE,
};
use crate::error::{Error, Result};

/// Payloads above this many bytes are considered for LZ4 compression
const COMPRESSION_THRESHOLD: usize = 64;

/// Fallible cursor over a byte slice
pub struct BinaryReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    pub fn remaining(&self) -> usize {
        let len = self.cursor.get_ref().len() as u64;
        len.saturating_sub(self.cursor.position()) as usize
    }

    fn require(&self, needed: usize) -> Result<()> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(Error::UnexpectedEof { needed, remaining });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.require(1)?;
        Ok(self.cursor.read_u8()?)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.require(2)?;
        Ok(self.cursor.read_u16::<BigEndian>()?)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.require(4)?;
        Ok(self.cursor.read_u32::<BigEndian>()?)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.require(8)?;
        Ok(self.cursor.read_u64::<BigEndian>()?)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.require(len)?;
        let mut buf = vec![0u8; len];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.require(N)?;
        let mut buf = [0u8; N];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read a length-prefixed UTF-8 string. The prefix is 1 byte when
    /// `max_len` fits in 255, otherwise 2 bytes big-endian.
    pub fn read_string(&mut self, max_len: usize) -> Result<String> {
        let len = if max_len <= u8::MAX as usize {
            self.read_u8()? as usize
        } else {
            self.read_u16()? as usize
        };
        if len > max_len {
            return Err(Error::MalformedPacket(format!(
                "String length {} exceeds maximum {}",
                len, max_len
            )));
        }
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|e| Error::MalformedPacket(format!("Invalid UTF-8: {}", e)))
    }

    /// Read a UUID as 16 raw bytes
    pub fn read_uuid(&mut self) -> Result<Uuid> {
        let bytes: [u8; 16] = self.read_array()?;
        Ok(Uuid::from_bytes(bytes))
    }
}

/// Infallible writer into a growable buffer
#[derive(Default)]
pub struct BinaryWriter {
    buf: Vec<u8>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a length-prefixed UTF-8 string; prefix width follows `max_len`
    /// the same way `BinaryReader::read_string` expects it.
    pub fn write_string(&mut self, value: &str, max_len: usize) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > max_len {
            return Err(Error::InvalidInput(format!(
                "String of {} bytes exceeds maximum {}",
                bytes.len(),
                max_len
            )));
        }
        if max_len <= u8::MAX as usize {
            self.write_u8(bytes.len() as u8);
        } else {
            self.write_u16(bytes.len() as u16);
        }
        self.write_bytes(bytes);
        Ok(())
    }

    pub fn write_uuid(&mut self, uuid: &Uuid) {
        self.write_bytes(uuid.as_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Lowercase hex encoding
pub fn encode_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Case-insensitive hex decoding; odd-length input fails
pub fn decode_hex(input: &str) -> Result<Vec<u8>> {
    hex::decode(input).map_err(|e| Error::InvalidInput(format!("Invalid hex: {}", e)))
}

/// Packet-level binary framing
pub struct BinaryProtocol;

impl BinaryProtocol {
    /// Encode a packet to wire format
    pub fn encode(packet: &BitchatPacket) -> Result<Vec<u8>> {
        if packet.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: packet.payload.len(),
                limit: MAX_PAYLOAD_SIZE,
            });
        }

        let (final_payload, is_compressed) = Self::prepare_payload(&packet.payload);

        let mut flags = packet.flags;
        if is_compressed {
            flags |= FLAG_PAYLOAD_COMPRESSED;
        } else {
            flags &= !FLAG_PAYLOAD_COMPRESSED;
        }
        if packet.recipient_id.is_some() {
            flags |= FLAG_RECIPIENT_PRESENT;
        } else if flags & FLAG_RECIPIENT_PRESENT != 0 {
            return Err(Error::MalformedPacket(
                "Recipient flag set but no recipient provided".into(),
            ));
        }
        if packet.signature.is_some() {
            flags |= FLAG_SIGNATURE_PRESENT;
        } else if flags & FLAG_SIGNATURE_PRESENT != 0 {
            return Err(Error::MalformedPacket(
                "Signature flag set but no signature provided".into(),
            ));
        }

        let mut writer = BinaryWriter::with_capacity(packet.wire_size());
        writer.write_u8(packet.version);
        writer.write_u8(packet.packet_type);
        writer.write_u8(packet.ttl);
        writer.write_u64(packet.timestamp);
        writer.write_u8(flags);
        writer.write_u16(final_payload.len() as u16);
        writer.write_bytes(&packet.sender_id);
        if let Some(recipient) = &packet.recipient_id {
            writer.write_bytes(recipient);
        }
        writer.write_bytes(&final_payload);
        if let Some(signature) = &packet.signature {
            writer.write_bytes(signature);
        }

        Ok(writer.into_bytes())
    }

    /// Decode a packet from wire format.
    ///
    /// The advertised payload length is checked against the remaining buffer
    /// exactly; trailing or missing bytes are malformed.
    pub fn decode(data: &[u8]) -> Result<BitchatPacket> {
        if data.len() < HEADER_SIZE + SENDER_ID_SIZE {
            return Err(Error::PacketTooSmall {
                expected: HEADER_SIZE + SENDER_ID_SIZE,
                actual: data.len(),
            });
        }

        let mut reader = BinaryReader::new(data);

        let version = reader.read_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        let packet_type = reader.read_u8()?;
        let ttl = reader.read_u8()?;
        let timestamp = reader.read_u64()?;
        let flags = reader.read_u8()?;
        let payload_len = reader.read_u16()? as usize;

        let sender_id: [u8; SENDER_ID_SIZE] = reader.read_array()?;

        let recipient_id = if flags & FLAG_RECIPIENT_PRESENT != 0 {
            Some(reader.read_array::<RECIPIENT_ID_SIZE>()?)
        } else {
            None
        };

        let has_signature = flags & FLAG_SIGNATURE_PRESENT != 0;
        let expected = payload_len + if has_signature { SIGNATURE_SIZE } else { 0 };
        if reader.remaining() != expected {
            return Err(Error::MalformedPacket(format!(
                "Payload length mismatch: header says {}, got {}",
                expected,
                reader.remaining()
            )));
        }

        let payload_bytes = reader.read_bytes(payload_len)?;
        let signature = if has_signature {
            Some(reader.read_array::<SIGNATURE_SIZE>()?)
        } else {
            None
        };

        let (payload, flags) = if flags & FLAG_PAYLOAD_COMPRESSED != 0 {
            let decompressed = Self::decompress_payload(&payload_bytes)?;
            if decompressed.len() > MAX_PAYLOAD_SIZE {
                return Err(Error::PayloadTooLarge {
                    size: decompressed.len(),
                    limit: MAX_PAYLOAD_SIZE,
                });
            }
            (decompressed, flags & !FLAG_PAYLOAD_COMPRESSED)
        } else {
            (payload_bytes, flags)
        };

        Ok(BitchatPacket {
            version,
            packet_type,
            ttl,
            timestamp,
            flags,
            sender_id,
            recipient_id,
            payload,
            signature,
        })
    }

    /// Compress the payload when it is large enough and compression helps
    fn prepare_payload(payload: &[u8]) -> (Vec<u8>, bool) {
        if payload.len() > COMPRESSION_THRESHOLD {
            let compressed = compress_prepend_size(payload);
            if compressed.len() < payload.len() {
                return (compressed, true);
            }
        }
        (payload.to_vec(), false)
    }

    fn decompress_payload(compressed: &[u8]) -> Result<Vec<u8>> {
        decompress_size_prepended(compressed)
            .map_err(|e| Error::DecompressionError(format!("{:?}", e)))
    }
}
