//! Typed message bodies and their CBOR map encoding.
//!
//! Every body travels as a self-describing CBOR map: field names preserved,
//! optional fields omitted entirely when absent (absent and empty stay
//! distinct for decoders). The variant is selected solely by the header's
//! type code; the codec never inspects the payload to guess.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::header::MsgType;
use crate::node::{NodeDescriptor, NodeId};

/// Status code for acks: accepted.
pub const STATUS_OK: u8 = 1;
/// Status code for acks: rejected.
pub const STATUS_FAILED: u8 = 0;

/// One sensor reading inside a data report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// One standing request for a sensor node's output. `sensors`/`actuators`
/// absent means "everything the node offers".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actuators: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataReport {
    pub request_id: u32,
    pub readings: Vec<SensorReading>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub request_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub request_id: u32,
    pub actuator_id: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub request_id: u32,
    pub status: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
    pub request_id: u32,
    pub entries: Vec<SubscriptionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub request_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeAck {
    pub request_id: u32,
    pub subscription_id: u32,
    pub status: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeAck {
    pub request_id: u32,
    pub status: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announce {
    pub request_id: u32,
    pub descriptor: NodeDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnounceAck {
    pub request_id: u32,
    pub status: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitiesQuery {
    pub request_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitiesList {
    pub request_id: u32,
    pub nodes: Vec<NodeDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub request_id: u32,
    pub image_id: uuid::Uuid,
    pub total_size: u64,
    pub chunk_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageChunk {
    pub image_id: uuid::Uuid,
    pub index: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTransferAck {
    pub image_id: uuid::Uuid,
    pub status: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
}

/// The closed set of message bodies, one variant per type code plus the
/// zero-length `None` body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    DataReport(DataReport),
    DataRequest(DataRequest),
    Command(Command),
    CommandAck(CommandAck),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    SubscribeAck(SubscribeAck),
    UnsubscribeAck(UnsubscribeAck),
    Announce(Announce),
    AnnounceAck(AnnounceAck),
    CapabilitiesQuery(CapabilitiesQuery),
    CapabilitiesList(CapabilitiesList),
    ImageMetadata(ImageMetadata),
    ImageChunk(ImageChunk),
    ImageTransferAck(ImageTransferAck),
    Error(ErrorBody),
    None,
}

impl Body {
    /// Type code implied by the variant; `None` bodies carry no code of
    /// their own and take whatever the header declares.
    pub fn kind(&self) -> Option<MsgType> {
        match self {
            Body::DataReport(_) => Some(MsgType::DataReport),
            Body::DataRequest(_) => Some(MsgType::DataRequest),
            Body::Command(_) => Some(MsgType::Command),
            Body::CommandAck(_) => Some(MsgType::CommandAck),
            Body::Subscribe(_) => Some(MsgType::Subscribe),
            Body::Unsubscribe(_) => Some(MsgType::Unsubscribe),
            Body::SubscribeAck(_) => Some(MsgType::SubscribeAck),
            Body::UnsubscribeAck(_) => Some(MsgType::UnsubscribeAck),
            Body::Announce(_) => Some(MsgType::Announce),
            Body::AnnounceAck(_) => Some(MsgType::AnnounceAck),
            Body::CapabilitiesQuery(_) => Some(MsgType::CapabilitiesQuery),
            Body::CapabilitiesList(_) => Some(MsgType::CapabilitiesList),
            Body::ImageMetadata(_) => Some(MsgType::ImageMetadata),
            Body::ImageChunk(_) => Some(MsgType::ImageChunk),
            Body::ImageTransferAck(_) => Some(MsgType::ImageTransferAck),
            Body::Error(_) => Some(MsgType::Error),
            Body::None => None,
        }
    }

    /// Whether this body may travel under the given type code.
    pub fn matches(&self, msg_type: MsgType) -> bool {
        match self.kind() {
            Some(k) => k == msg_type,
            None => true,
        }
    }

    /// Encode into CBOR bytes. A `None` body encodes to zero bytes.
    pub fn encode(&self) -> Result<Vec<u8>, BodyError> {
        match self {
            Body::DataReport(b) => to_vec(b),
            Body::DataRequest(b) => to_vec(b),
            Body::Command(b) => to_vec(b),
            Body::CommandAck(b) => to_vec(b),
            Body::Subscribe(b) => to_vec(b),
            Body::Unsubscribe(b) => to_vec(b),
            Body::SubscribeAck(b) => to_vec(b),
            Body::UnsubscribeAck(b) => to_vec(b),
            Body::Announce(b) => to_vec(b),
            Body::AnnounceAck(b) => to_vec(b),
            Body::CapabilitiesQuery(b) => to_vec(b),
            Body::CapabilitiesList(b) => to_vec(b),
            Body::ImageMetadata(b) => to_vec(b),
            Body::ImageChunk(b) => to_vec(b),
            Body::ImageTransferAck(b) => to_vec(b),
            Body::Error(b) => to_vec(b),
            Body::None => Ok(Vec::new()),
        }
    }

    /// Decode the body for the declared type code. Empty payloads decode to
    /// `Body::None`. Malformed bytes yield a structured decode error, never
    /// a panic and never a zero-valued struct.
    pub fn decode(msg_type: MsgType, bytes: &[u8]) -> Result<Self, BodyError> {
        if bytes.is_empty() {
            return Ok(Body::None);
        }
        Ok(match msg_type {
            MsgType::DataReport => Body::DataReport(from_slice(bytes)?),
            MsgType::DataRequest => Body::DataRequest(from_slice(bytes)?),
            MsgType::Command => Body::Command(from_slice(bytes)?),
            MsgType::CommandAck => Body::CommandAck(from_slice(bytes)?),
            MsgType::Subscribe => Body::Subscribe(from_slice(bytes)?),
            MsgType::Unsubscribe => Body::Unsubscribe(from_slice(bytes)?),
            MsgType::SubscribeAck => Body::SubscribeAck(from_slice(bytes)?),
            MsgType::UnsubscribeAck => Body::UnsubscribeAck(from_slice(bytes)?),
            MsgType::Announce => Body::Announce(from_slice(bytes)?),
            MsgType::AnnounceAck => Body::AnnounceAck(from_slice(bytes)?),
            MsgType::CapabilitiesQuery => Body::CapabilitiesQuery(from_slice(bytes)?),
            MsgType::CapabilitiesList => Body::CapabilitiesList(from_slice(bytes)?),
            MsgType::ImageMetadata => Body::ImageMetadata(from_slice(bytes)?),
            MsgType::ImageChunk => Body::ImageChunk(from_slice(bytes)?),
            MsgType::ImageTransferAck => Body::ImageTransferAck(from_slice(bytes)?),
            MsgType::Error => Body::Error(from_slice(bytes)?),
        })
    }
}

fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, BodyError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| BodyError::Encode(e.to_string()))?;
    Ok(out)
}

fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BodyError> {
    ciborium::de::from_reader(bytes).map_err(|e| BodyError::Decode(e.to_string()))
}

/// Error encoding or decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("body encode error: {0}")]
    Encode(String),
    #[error("body decode error: {0}")]
    Decode(String),
}
