//! TLV (Type-Length-Value) typed payloads.
//!
//! Packet-level TLVs use a 1-byte type and 2-byte big-endian length.
//! Identity TLVs (ANNOUNCE fields) use a 1-byte length.
//!
//! Announce, chat, sync, and file payloads tolerate unknown TLV types by
//! skipping them; the inner Noise payloads are strict and reject anything
//! they do not understand.

use uuid::Uuid;

use super::binary::{BinaryReader, BinaryWriter};
use crate::error::{Error, Result};

/// Maximum nickname length in bytes
pub const MAX_NICKNAME_LEN: usize = 64;
/// Maximum chat content length in bytes
pub const MAX_CONTENT_LEN: usize = 4096;

// Identity announcement TLV types (1-byte length)
const ANNOUNCE_TLV_NICKNAME: u8 = 0x01;
const ANNOUNCE_TLV_NOISE_PUBLIC: u8 = 0x02;
const ANNOUNCE_TLV_SIGNING_PUBLIC: u8 = 0x03;
const ANNOUNCE_TLV_FEATURES: u8 = 0x04;

// Chat message TLV types (2-byte length)
const MESSAGE_TLV_ID: u8 = 0x01;
const MESSAGE_TLV_NICKNAME: u8 = 0x02;
const MESSAGE_TLV_CONTENT: u8 = 0x03;
const MESSAGE_TLV_CHANNEL: u8 = 0x04;
const MESSAGE_TLV_CHANNEL_CIPHERTEXT: u8 = 0x05;

// Inner Noise payload discriminants
const NOISE_PAYLOAD_PRIVATE_MESSAGE: u8 = 0x01;
const NOISE_PAYLOAD_READ_RECEIPT: u8 = 0x02;
const NOISE_PAYLOAD_DELIVERY_ACK: u8 = 0x03;

// Private message TLV types (2-byte length, strict)
const PRIVATE_TLV_ID: u8 = 0x01;
const PRIVATE_TLV_NICKNAME: u8 = 0x02;
const PRIVATE_TLV_CONTENT: u8 = 0x03;
const RECEIPT_TLV_MESSAGE_ID: u8 = 0x01;

// Request-sync TLV types (2-byte length)
const SYNC_TLV_P: u8 = 0x01;
const SYNC_TLV_M: u8 = 0x02;
const SYNC_TLV_FILTER_DATA: u8 = 0x03;
const SYNC_TLV_TYPE_FILTER: u8 = 0x04;
const SYNC_TLV_SINCE_TIMESTAMP: u8 = 0x05;
const SYNC_TLV_FRAGMENT_FILTER: u8 = 0x06;

// File transfer TLV types (2-byte length)
const FILE_TLV_NAME: u8 = 0x01;
const FILE_TLV_MIME_TYPE: u8 = 0x02;
const FILE_TLV_CONTENT: u8 = 0x03;

/// Write one packet-level TLV field (2-byte length)
fn write_tlv(writer: &mut BinaryWriter, field_type: u8, value: &[u8]) -> Result<()> {
    if value.len() > u16::MAX as usize {
        return Err(Error::InvalidInput(format!(
            "TLV value of {} bytes exceeds u16 length",
            value.len()
        )));
    }
    writer.write_u8(field_type);
    writer.write_u16(value.len() as u16);
    writer.write_bytes(value);
    Ok(())
}

/// Write one identity TLV field (1-byte length)
fn write_identity_tlv(writer: &mut BinaryWriter, field_type: u8, value: &[u8]) -> Result<()> {
    if value.len() > u8::MAX as usize {
        return Err(Error::InvalidInput(format!(
            "Identity TLV value of {} bytes exceeds u8 length",
            value.len()
        )));
    }
    writer.write_u8(field_type);
    writer.write_u8(value.len() as u8);
    writer.write_bytes(value);
    Ok(())
}

/// Read the next packet-level TLV field, if any
fn read_tlv(reader: &mut BinaryReader) -> Result<Option<(u8, Vec<u8>)>> {
    if reader.remaining() == 0 {
        return Ok(None);
    }
    let field_type = reader.read_u8()?;
    let len = reader.read_u16()? as usize;
    let value = reader.read_bytes(len)?;
    Ok(Some((field_type, value)))
}

/// Read the next identity TLV field, if any
fn read_identity_tlv(reader: &mut BinaryReader) -> Result<Option<(u8, Vec<u8>)>> {
    if reader.remaining() == 0 {
        return Ok(None);
    }
    let field_type = reader.read_u8()?;
    let len = reader.read_u8()? as usize;
    let value = reader.read_bytes(len)?;
    Ok(Some((field_type, value)))
}

fn to_key(value: Vec<u8>, what: &str) -> Result<[u8; 32]> {
    value
        .try_into()
        .map_err(|_| Error::MalformedPacket(format!("{} must be 32 bytes", what)))
}

fn to_uuid(value: Vec<u8>, what: &str) -> Result<Uuid> {
    let bytes: [u8; 16] = value
        .try_into()
        .map_err(|_| Error::MalformedPacket(format!("{} must be 16 bytes", what)))?;
    Ok(Uuid::from_bytes(bytes))
}

fn to_u64(value: Vec<u8>, what: &str) -> Result<u64> {
    let bytes: [u8; 8] = value
        .try_into()
        .map_err(|_| Error::MalformedPacket(format!("{} must be 8 bytes", what)))?;
    Ok(u64::from_be_bytes(bytes))
}

fn utf8(value: Vec<u8>, what: &str) -> Result<String> {
    String::from_utf8(value)
        .map_err(|_| Error::MalformedPacket(format!("{} is not valid UTF-8", what)))
}

/// Identity announcement carried by ANNOUNCE packets.
///
/// The current schema carries separate Noise and signing keys plus an
/// optional feature bitmask; the legacy schema carried a single public key.
/// Decoding tolerates the legacy form (no signing key) and skips unknown
/// TLV types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityAnnouncement {
    pub nickname: String,
    pub noise_public: [u8; 32],
    pub signing_public: Option<[u8; 32]>,
    pub features: Option<u32>,
}

impl IdentityAnnouncement {
    pub fn new(nickname: String, noise_public: [u8; 32], signing_public: [u8; 32]) -> Self {
        Self {
            nickname,
            noise_public,
            signing_public: Some(signing_public),
            features: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.nickname.len() > MAX_NICKNAME_LEN {
            return Err(Error::InvalidInput(format!(
                "Nickname of {} bytes exceeds maximum {}",
                self.nickname.len(),
                MAX_NICKNAME_LEN
            )));
        }
        let mut writer = BinaryWriter::new();
        write_identity_tlv(&mut writer, ANNOUNCE_TLV_NICKNAME, self.nickname.as_bytes())?;
        write_identity_tlv(&mut writer, ANNOUNCE_TLV_NOISE_PUBLIC, &self.noise_public)?;
        if let Some(signing) = &self.signing_public {
            write_identity_tlv(&mut writer, ANNOUNCE_TLV_SIGNING_PUBLIC, signing)?;
        }
        if let Some(features) = self.features {
            write_identity_tlv(&mut writer, ANNOUNCE_TLV_FEATURES, &features.to_be_bytes())?;
        }
        Ok(writer.into_bytes())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = BinaryReader::new(data);
        let mut nickname = None;
        let mut noise_public = None;
        let mut signing_public = None;
        let mut features = None;

        while let Some((field_type, value)) = read_identity_tlv(&mut reader)? {
            match field_type {
                ANNOUNCE_TLV_NICKNAME => nickname = Some(utf8(value, "nickname")?),
                ANNOUNCE_TLV_NOISE_PUBLIC => {
                    noise_public = Some(to_key(value, "noise public key")?)
                }
                ANNOUNCE_TLV_SIGNING_PUBLIC => {
                    signing_public = Some(to_key(value, "signing public key")?)
                }
                ANNOUNCE_TLV_FEATURES => {
                    let bytes: [u8; 4] = value
                        .try_into()
                        .map_err(|_| Error::MalformedPacket("features must be 4 bytes".into()))?;
                    features = Some(u32::from_be_bytes(bytes));
                }
                _ => {} // forward compatibility: skip unknown fields
            }
        }

        Ok(Self {
            nickname: nickname
                .ok_or_else(|| Error::MalformedPacket("Announce missing nickname".into()))?,
            noise_public: noise_public
                .ok_or_else(|| Error::MalformedPacket("Announce missing public key".into()))?,
            signing_public,
            features,
        })
    }
}

/// Content of a broadcast MESSAGE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    /// Plaintext broadcast chat
    Plain(String),
    /// Channel chat encrypted with the channel key (`iv || ciphertext || tag`)
    Channel { channel: String, ciphertext: Vec<u8> },
}

/// Broadcast or channel chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub nickname: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn plain(nickname: String, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            nickname,
            content: MessageContent::Plain(content),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = BinaryWriter::new();
        write_tlv(&mut writer, MESSAGE_TLV_ID, self.id.as_bytes())?;
        write_tlv(&mut writer, MESSAGE_TLV_NICKNAME, self.nickname.as_bytes())?;
        match &self.content {
            MessageContent::Plain(text) => {
                if text.len() > MAX_CONTENT_LEN {
                    return Err(Error::InvalidInput("Message content too long".into()));
                }
                write_tlv(&mut writer, MESSAGE_TLV_CONTENT, text.as_bytes())?;
            }
            MessageContent::Channel {
                channel,
                ciphertext,
            } => {
                write_tlv(&mut writer, MESSAGE_TLV_CHANNEL, channel.as_bytes())?;
                write_tlv(&mut writer, MESSAGE_TLV_CHANNEL_CIPHERTEXT, ciphertext)?;
            }
        }
        Ok(writer.into_bytes())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = BinaryReader::new(data);
        let mut id = None;
        let mut nickname = None;
        let mut content = None;
        let mut channel = None;
        let mut ciphertext = None;

        while let Some((field_type, value)) = read_tlv(&mut reader)? {
            match field_type {
                MESSAGE_TLV_ID => id = Some(to_uuid(value, "message id")?),
                MESSAGE_TLV_NICKNAME => nickname = Some(utf8(value, "nickname")?),
                MESSAGE_TLV_CONTENT => content = Some(utf8(value, "content")?),
                MESSAGE_TLV_CHANNEL => channel = Some(utf8(value, "channel")?),
                MESSAGE_TLV_CHANNEL_CIPHERTEXT => ciphertext = Some(value),
                _ => {} // skip unknown fields
            }
        }

        let content = match (content, channel, ciphertext) {
            (_, Some(channel), Some(ciphertext)) => MessageContent::Channel {
                channel,
                ciphertext,
            },
            (Some(text), _, _) => MessageContent::Plain(text),
            _ => {
                return Err(Error::MalformedPacket(
                    "Message carries neither plaintext nor channel ciphertext".into(),
                ))
            }
        };

        Ok(Self {
            id: id.ok_or_else(|| Error::MalformedPacket("Message missing id".into()))?,
            nickname: nickname
                .ok_or_else(|| Error::MalformedPacket("Message missing nickname".into()))?,
            content,
        })
    }
}

/// Private message carried inside a Noise transport payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    pub id: Uuid,
    pub nickname: String,
    pub content: String,
}

/// Inner payload of a NOISE_ENCRYPTED packet.
///
/// Framed as a 1-byte discriminant followed by TLV fields. Decoding is
/// strict: unknown discriminants and unknown TLV types are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoisePayload {
    PrivateMessage(PrivateMessage),
    ReadReceipt { message_id: Uuid },
    DeliveryAck { message_id: Uuid },
}

impl NoisePayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = BinaryWriter::new();
        match self {
            NoisePayload::PrivateMessage(message) => {
                if message.content.len() > MAX_CONTENT_LEN {
                    return Err(Error::InvalidInput("Message content too long".into()));
                }
                writer.write_u8(NOISE_PAYLOAD_PRIVATE_MESSAGE);
                write_tlv(&mut writer, PRIVATE_TLV_ID, message.id.as_bytes())?;
                write_tlv(&mut writer, PRIVATE_TLV_NICKNAME, message.nickname.as_bytes())?;
                write_tlv(&mut writer, PRIVATE_TLV_CONTENT, message.content.as_bytes())?;
            }
            NoisePayload::ReadReceipt { message_id } => {
                writer.write_u8(NOISE_PAYLOAD_READ_RECEIPT);
                write_tlv(&mut writer, RECEIPT_TLV_MESSAGE_ID, message_id.as_bytes())?;
            }
            NoisePayload::DeliveryAck { message_id } => {
                writer.write_u8(NOISE_PAYLOAD_DELIVERY_ACK);
                write_tlv(&mut writer, RECEIPT_TLV_MESSAGE_ID, message_id.as_bytes())?;
            }
        }
        Ok(writer.into_bytes())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = BinaryReader::new(data);
        let discriminant = reader.read_u8()?;
        match discriminant {
            NOISE_PAYLOAD_PRIVATE_MESSAGE => {
                let mut id = None;
                let mut nickname = None;
                let mut content = None;
                while let Some((field_type, value)) = read_tlv(&mut reader)? {
                    match field_type {
                        PRIVATE_TLV_ID => id = Some(to_uuid(value, "message id")?),
                        PRIVATE_TLV_NICKNAME => nickname = Some(utf8(value, "nickname")?),
                        PRIVATE_TLV_CONTENT => content = Some(utf8(value, "content")?),
                        other => {
                            return Err(Error::MalformedPacket(format!(
                                "Unknown private message TLV type 0x{:02x}",
                                other
                            )))
                        }
                    }
                }
                Ok(NoisePayload::PrivateMessage(PrivateMessage {
                    id: id.ok_or_else(|| {
                        Error::MalformedPacket("Private message missing id".into())
                    })?,
                    nickname: nickname.ok_or_else(|| {
                        Error::MalformedPacket("Private message missing nickname".into())
                    })?,
                    content: content.ok_or_else(|| {
                        Error::MalformedPacket("Private message missing content".into())
                    })?,
                }))
            }
            NOISE_PAYLOAD_READ_RECEIPT | NOISE_PAYLOAD_DELIVERY_ACK => {
                let mut message_id = None;
                while let Some((field_type, value)) = read_tlv(&mut reader)? {
                    match field_type {
                        RECEIPT_TLV_MESSAGE_ID => {
                            message_id = Some(to_uuid(value, "message id")?)
                        }
                        other => {
                            return Err(Error::MalformedPacket(format!(
                                "Unknown receipt TLV type 0x{:02x}",
                                other
                            )))
                        }
                    }
                }
                let message_id = message_id
                    .ok_or_else(|| Error::MalformedPacket("Receipt missing message id".into()))?;
                if discriminant == NOISE_PAYLOAD_READ_RECEIPT {
                    Ok(NoisePayload::ReadReceipt { message_id })
                } else {
                    Ok(NoisePayload::DeliveryAck { message_id })
                }
            }
            other => Err(Error::MalformedPacket(format!(
                "Unknown noise payload type 0x{:02x}",
                other
            ))),
        }
    }
}

/// GCS filter summary carried by REQUEST_SYNC packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSyncPayload {
    /// Golomb-Rice parameter; false-positive rate is about 2^-p
    pub p: u8,
    /// Hash domain size, n * 2^p
    pub m: u64,
    /// Packed filter bitstream
    pub filter_data: Vec<u8>,
    /// Only replay packets of these types
    pub type_filter: Option<Vec<u8>>,
    /// Only replay packets at or after this timestamp (ms epoch)
    pub since_timestamp: Option<u64>,
    /// Only replay fragments of this message
    pub fragment_filter: Option<[u8; 8]>,
}

impl RequestSyncPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = BinaryWriter::new();
        write_tlv(&mut writer, SYNC_TLV_P, &[self.p])?;
        write_tlv(&mut writer, SYNC_TLV_M, &self.m.to_be_bytes())?;
        write_tlv(&mut writer, SYNC_TLV_FILTER_DATA, &self.filter_data)?;
        if let Some(types) = &self.type_filter {
            write_tlv(&mut writer, SYNC_TLV_TYPE_FILTER, types)?;
        }
        if let Some(since) = self.since_timestamp {
            write_tlv(&mut writer, SYNC_TLV_SINCE_TIMESTAMP, &since.to_be_bytes())?;
        }
        if let Some(fragment_id) = &self.fragment_filter {
            write_tlv(&mut writer, SYNC_TLV_FRAGMENT_FILTER, fragment_id)?;
        }
        Ok(writer.into_bytes())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = BinaryReader::new(data);
        let mut p = None;
        let mut m = None;
        let mut filter_data = None;
        let mut type_filter = None;
        let mut since_timestamp = None;
        let mut fragment_filter = None;

        while let Some((field_type, value)) = read_tlv(&mut reader)? {
            match field_type {
                SYNC_TLV_P => {
                    let bytes: [u8; 1] = value
                        .try_into()
                        .map_err(|_| Error::MalformedPacket("p must be 1 byte".into()))?;
                    p = Some(bytes[0]);
                }
                SYNC_TLV_M => m = Some(to_u64(value, "m")?),
                SYNC_TLV_FILTER_DATA => filter_data = Some(value),
                SYNC_TLV_TYPE_FILTER => type_filter = Some(value),
                SYNC_TLV_SINCE_TIMESTAMP => {
                    since_timestamp = Some(to_u64(value, "since timestamp")?)
                }
                SYNC_TLV_FRAGMENT_FILTER => {
                    let bytes: [u8; 8] = value.try_into().map_err(|_| {
                        Error::MalformedPacket("fragment filter must be 8 bytes".into())
                    })?;
                    fragment_filter = Some(bytes);
                }
                _ => {} // skip unknown fields
            }
        }

        Ok(Self {
            p: p.ok_or_else(|| Error::MalformedPacket("Sync request missing p".into()))?,
            m: m.ok_or_else(|| Error::MalformedPacket("Sync request missing m".into()))?,
            filter_data: filter_data
                .ok_or_else(|| Error::MalformedPacket("Sync request missing filter".into()))?,
            type_filter,
            since_timestamp,
            fragment_filter,
        })
    }
}

/// TLV-wrapped file transfer payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

impl FilePayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = BinaryWriter::new();
        write_tlv(&mut writer, FILE_TLV_NAME, self.name.as_bytes())?;
        write_tlv(&mut writer, FILE_TLV_MIME_TYPE, self.mime_type.as_bytes())?;
        write_tlv(&mut writer, FILE_TLV_CONTENT, &self.content)?;
        Ok(writer.into_bytes())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = BinaryReader::new(data);
        let mut name = None;
        let mut mime_type = None;
        let mut content = None;

        while let Some((field_type, value)) = read_tlv(&mut reader)? {
            match field_type {
                FILE_TLV_NAME => name = Some(utf8(value, "file name")?),
                FILE_TLV_MIME_TYPE => mime_type = Some(utf8(value, "mime type")?),
                FILE_TLV_CONTENT => content = Some(value),
                _ => {} // skip unknown fields
            }
        }

        Ok(Self {
            name: name.ok_or_else(|| Error::MalformedPacket("File missing name".into()))?,
            mime_type: mime_type
                .ok_or_else(|| Error::MalformedPacket("File missing mime type".into()))?,
            content: content
                .ok_or_else(|| Error::MalformedPacket("File missing content".into()))?,
        })
    }
}
