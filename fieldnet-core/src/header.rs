//! Fixed 33-byte framing header: magic, version, type code, source/target, correlation id.

use uuid::Uuid;

use crate::node::NodeId;

/// Protocol signature, first three bytes of every frame.
pub const MAGIC: [u8; 3] = *b"FNP";

/// Current protocol version. Byte 3 of the header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Encoded header size in bytes.
pub const HEADER_LEN: usize = 33;

// Byte offset of the payload-length field within an encoded header.
const PAYLOAD_LEN_OFFSET: usize = 13;

/// All wire message kinds. The header's type code is the sole selector for
/// the body variant; unknown codes are rejected at the header layer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    DataReport = 0x01,
    DataRequest = 0x02,
    ImageMetadata = 0x07,
    ImageChunk = 0x08,
    ImageTransferAck = 0x09,
    Subscribe = 0x0B,
    Unsubscribe = 0x0C,
    SubscribeAck = 0x0D,
    UnsubscribeAck = 0x0E,
    Command = 0x12,
    CommandAck = 0x13,
    AnnounceAck = 0x1D,
    Announce = 0x1E,
    CapabilitiesQuery = 0x21,
    CapabilitiesList = 0x22,
    Error = 0xFE,
}

impl From<MsgType> for u8 {
    fn from(t: MsgType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = HeaderError;

    fn try_from(code: u8) -> Result<Self, HeaderError> {
        match code {
            0x01 => Ok(Self::DataReport),
            0x02 => Ok(Self::DataRequest),
            0x07 => Ok(Self::ImageMetadata),
            0x08 => Ok(Self::ImageChunk),
            0x09 => Ok(Self::ImageTransferAck),
            0x0B => Ok(Self::Subscribe),
            0x0C => Ok(Self::Unsubscribe),
            0x0D => Ok(Self::SubscribeAck),
            0x0E => Ok(Self::UnsubscribeAck),
            0x12 => Ok(Self::Command),
            0x13 => Ok(Self::CommandAck),
            0x1D => Ok(Self::AnnounceAck),
            0x1E => Ok(Self::Announce),
            0x21 => Ok(Self::CapabilitiesQuery),
            0x22 => Ok(Self::CapabilitiesList),
            0xFE => Ok(MsgType::Error),
            other => Err(HeaderError::UnknownType(other)),
        }
    }
}

/// Framing header. Immutable once built; the payload length is not stored
/// here, it is computed from the encoded body at serialize time and supplied
/// to [`Header::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    magic: [u8; 3],
    version: u8,
    msg_type: MsgType,
    source: NodeId,
    target: NodeId,
    correlation_id: Uuid,
}

impl Header {
    /// Build a header for an outgoing packet. Magic and version are fixed;
    /// the correlation id is freshly generated and never reused.
    pub fn new(msg_type: MsgType, source: NodeId, target: NodeId) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            msg_type,
            source,
            target,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Build a header from untrusted parts (decode path). Rejects a wrong
    /// magic before the header can be used anywhere.
    pub fn from_parts(
        magic: [u8; 3],
        version: u8,
        msg_type: MsgType,
        source: NodeId,
        target: NodeId,
        correlation_id: Uuid,
    ) -> Result<Self, HeaderError> {
        if magic != MAGIC {
            return Err(HeaderError::BadMagic(magic));
        }
        Ok(Self {
            magic,
            version,
            msg_type,
            source,
            target,
            correlation_id,
        })
    }

    /// Fresh header addressed to a different target: same type, source and
    /// correlation id. Used by the fan-out path so no packet is ever mutated
    /// while another task may be serializing it.
    pub fn retargeted(&self, target: NodeId) -> Self {
        Self {
            target,
            ..self.clone()
        }
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Magic re-check for decoded headers, used before trusting one.
    pub fn is_valid_magic(&self) -> bool {
        self.magic == MAGIC
    }

    /// Encode into exactly 33 bytes, big-endian. `payload_len` is the length
    /// of the already-encoded body that will follow this header.
    pub fn encode(&self, payload_len: u32) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..3].copy_from_slice(&self.magic);
        out[3] = self.version;
        out[4] = self.msg_type.into();
        out[5..9].copy_from_slice(&self.source.0.to_be_bytes());
        out[9..13].copy_from_slice(&self.target.0.to_be_bytes());
        out[13..17].copy_from_slice(&payload_len.to_be_bytes());
        let (hi, lo) = self.correlation_id.as_u64_pair();
        out[17..25].copy_from_slice(&hi.to_be_bytes());
        out[25..33].copy_from_slice(&lo.to_be_bytes());
        out
    }

    /// Decode a header from the front of `bytes`. Returns the header and the
    /// declared payload length. Fewer than 33 bytes is a hard error, not a
    /// partial result.
    pub fn decode(bytes: &[u8]) -> Result<(Self, u32), HeaderError> {
        if bytes.len() < HEADER_LEN {
            return Err(HeaderError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let magic = [bytes[0], bytes[1], bytes[2]];
        let version = bytes[3];
        let msg_type = MsgType::try_from(bytes[4])?;
        let source = NodeId(u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]));
        let target = NodeId(u32::from_be_bytes([
            bytes[9], bytes[10], bytes[11], bytes[12],
        ]));
        let payload_len = u32::from_be_bytes([bytes[13], bytes[14], bytes[15], bytes[16]]);
        let mut hi = [0u8; 8];
        hi.copy_from_slice(&bytes[17..25]);
        let mut lo = [0u8; 8];
        lo.copy_from_slice(&bytes[25..33]);
        let correlation_id = Uuid::from_u64_pair(u64::from_be_bytes(hi), u64::from_be_bytes(lo));
        let header = Self::from_parts(magic, version, msg_type, source, target, correlation_id)?;
        Ok((header, payload_len))
    }

    /// Read the declared payload length out of raw header bytes without a
    /// full decode. Lets a stream reader consume the body of a packet whose
    /// type code it does not recognize, keeping the stream position valid.
    pub fn peek_payload_len(bytes: &[u8]) -> Result<u32, HeaderError> {
        if bytes.len() < HEADER_LEN {
            return Err(HeaderError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0..3] != MAGIC {
            return Err(HeaderError::BadMagic([bytes[0], bytes[1], bytes[2]]));
        }
        Ok(u32::from_be_bytes([
            bytes[PAYLOAD_LEN_OFFSET],
            bytes[PAYLOAD_LEN_OFFSET + 1],
            bytes[PAYLOAD_LEN_OFFSET + 2],
            bytes[PAYLOAD_LEN_OFFSET + 3],
        ]))
    }
}

/// Error decoding or constructing a header.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("header truncated: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("bad protocol magic {0:02X?}")]
    BadMagic([u8; 3]),
    #[error("unknown message type code 0x{0:02X}")]
    UnknownType(u8),
}
