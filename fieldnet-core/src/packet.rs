//! Packet framing: one header plus one body, with length bookkeeping.

use crate::body::{Body, BodyError};
use crate::header::{Header, HeaderError, MsgType, HEADER_LEN};
use crate::node::NodeId;

/// One header and its matching body. Immutable once built; the payload
/// length is never stored, it is computed from the encoded body at
/// serialize time.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    header: Header,
    body: Body,
}

impl Packet {
    /// Build an outgoing packet. The body must agree with the declared type
    /// code (a `None` body may travel under any code).
    pub fn new(
        msg_type: MsgType,
        source: NodeId,
        target: NodeId,
        body: Body,
    ) -> Result<Self, PacketError> {
        if !body.matches(msg_type) {
            return Err(PacketError::KindMismatch {
                declared: msg_type,
                body: body.kind(),
            });
        }
        Ok(Self {
            header: Header::new(msg_type, source, target),
            body,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Fresh copy addressed to `target`: new header, same correlation id,
    /// cloned body. The fan-out path builds one of these per recipient
    /// instead of retargeting a shared packet in place.
    pub fn retargeted(&self, target: NodeId) -> Self {
        Self {
            header: self.header.retargeted(target),
            body: self.body.clone(),
        }
    }

    /// Serialize to header ‖ body. The body is encoded first so the header
    /// always carries the real payload length.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        let payload = self.body.encode()?;
        let header = self.header.encode(payload.len() as u32);
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode a packet from a raw buffer containing header and body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let (header, payload_len) = Header::decode(bytes)?;
        let available = bytes.len() - HEADER_LEN;
        if available < payload_len as usize {
            return Err(PacketError::Incomplete {
                expected: payload_len as usize,
                actual: available,
            });
        }
        let body_bytes = &bytes[HEADER_LEN..HEADER_LEN + payload_len as usize];
        Self::assemble(header, payload_len, body_bytes)
    }

    /// Decode from pre-split header and body bytes, as produced by a stream
    /// reader that read the fixed header first and then the declared length.
    pub fn from_parts(header_bytes: &[u8], body_bytes: &[u8]) -> Result<Self, PacketError> {
        let (header, payload_len) = Header::decode(header_bytes)?;
        if body_bytes.len() < payload_len as usize {
            return Err(PacketError::Incomplete {
                expected: payload_len as usize,
                actual: body_bytes.len(),
            });
        }
        Self::assemble(header, payload_len, &body_bytes[..payload_len as usize])
    }

    fn assemble(header: Header, payload_len: u32, body_bytes: &[u8]) -> Result<Self, PacketError> {
        debug_assert!(header.is_valid_magic());
        debug_assert_eq!(body_bytes.len(), payload_len as usize);
        let body = Body::decode(header.msg_type(), body_bytes)?;
        Ok(Self { header, body })
    }
}

/// Error building, serializing or decoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Body(#[from] BodyError),
    #[error("incomplete packet: declared {expected} body bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },
    #[error("body {body:?} cannot travel under type code {declared:?}")]
    KindMismatch {
        declared: MsgType,
        body: Option<MsgType>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{Command, DataReport, SensorReading};

    fn sample_report() -> Packet {
        Packet::new(
            MsgType::DataReport,
            NodeId(0x10007),
            NodeId(1),
            Body::DataReport(DataReport {
                request_id: 0,
                readings: vec![SensorReading {
                    sensor_id: "temp".into(),
                    value: 19.25,
                    timestamp: None,
                }],
            }),
        )
        .unwrap()
    }

    #[test]
    fn roundtrip_with_length_bookkeeping() {
        let p = sample_report();
        let bytes = p.to_bytes().unwrap();
        // The serialized header carries the real encoded body length.
        let declared = Header::peek_payload_len(&bytes[..HEADER_LEN]).unwrap();
        assert_eq!(declared as usize, bytes.len() - HEADER_LEN);
        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.body(), p.body());
        assert_eq!(decoded.header().correlation_id(), p.header().correlation_id());
        assert_eq!(decoded.header().source(), p.header().source());
    }

    #[test]
    fn from_parts_roundtrip() {
        let p = sample_report();
        let bytes = p.to_bytes().unwrap();
        let decoded = Packet::from_parts(&bytes[..HEADER_LEN], &bytes[HEADER_LEN..]).unwrap();
        assert_eq!(decoded.body(), p.body());
    }

    #[test]
    fn short_body_is_incomplete_error_with_both_lengths() {
        let p = sample_report();
        let bytes = p.to_bytes().unwrap();
        let cut = bytes.len() - 3;
        match Packet::from_bytes(&bytes[..cut]).unwrap_err() {
            PacketError::Incomplete { expected, actual } => {
                assert_eq!(expected, bytes.len() - HEADER_LEN);
                assert_eq!(actual, bytes.len() - HEADER_LEN - 3);
            }
            other => panic!("expected Incomplete, got {other:?}"),
        }
    }

    #[test]
    fn short_header_is_header_error() {
        let p = sample_report();
        let bytes = p.to_bytes().unwrap();
        assert!(matches!(
            Packet::from_bytes(&bytes[..10]).unwrap_err(),
            PacketError::Header(HeaderError::Truncated { .. })
        ));
    }

    #[test]
    fn zero_length_body_roundtrips() {
        let p = Packet::new(MsgType::CapabilitiesQuery, NodeId(2), NodeId(1), Body::None).unwrap();
        let bytes = p.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.body(), &Body::None);
        assert_eq!(decoded.header().msg_type(), MsgType::CapabilitiesQuery);
    }

    #[test]
    fn kind_mismatch_rejected() {
        let err = Packet::new(
            MsgType::DataReport,
            NodeId(2),
            NodeId(1),
            Body::Command(Command {
                request_id: 1,
                actuator_id: "fan".into(),
                value: 1.0,
            }),
        )
        .unwrap_err();
        assert!(matches!(err, PacketError::KindMismatch { .. }));
    }

    #[test]
    fn retargeted_is_fresh_packet() {
        let p = sample_report();
        let r = p.retargeted(NodeId(3));
        assert_eq!(r.header().target(), NodeId(3));
        assert_eq!(r.header().source(), p.header().source());
        assert_eq!(r.body(), p.body());
        // Original untouched.
        assert_eq!(p.header().target(), NodeId(1));
    }
}
