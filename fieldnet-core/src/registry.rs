//! Server-side session and subscription registry.
//!
//! Id-keyed concurrent maps; connection tasks insert, remove and iterate
//! without one global lock. Actual socket writes happen behind the
//! [`PacketSink`] seam so the registry never touches I/O directly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::body::SubscriptionEntry;
use crate::node::{NodeDescriptor, NodeId, NodeType};
use crate::packet::{Packet, PacketError};

/// Outbound transport for one connection. Implementations must serialize
/// writes to their socket; the server funnels every frame for a connection
/// through a single writer task.
pub trait PacketSink: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), SinkClosed>;
}

/// The peer hung up; the frame was dropped.
#[derive(Debug, thiserror::Error)]
#[error("connection closed")]
pub struct SinkClosed;

/// One live connection: its sink plus the node id assigned at announce
/// time. The id is set once by the announce handler and read by the
/// connection's read loop to unregister on close.
pub struct Connection {
    sink: Arc<dyn PacketSink>,
    // 0 (the broadcast address) doubles as "not yet announced".
    node_id: AtomicU32,
}

impl Connection {
    pub fn new(sink: Arc<dyn PacketSink>) -> Self {
        Self {
            sink,
            node_id: AtomicU32::new(0),
        }
    }

    /// Node id assigned at announce time, if any.
    pub fn node_id(&self) -> Option<NodeId> {
        match self.node_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(NodeId(id)),
        }
    }

    pub fn set_node_id(&self, id: NodeId) {
        self.node_id.store(id.0, Ordering::Release);
    }

    /// Encode and hand the packet to the sink.
    pub fn send(&self, packet: &Packet) -> Result<(), SendError> {
        let frame = packet.to_bytes()?;
        self.sink.send_frame(frame)?;
        Ok(())
    }
}

/// Error delivering a packet to one connection.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Encode(#[from] PacketError),
    #[error(transparent)]
    Closed(#[from] SinkClosed),
}

/// Sessions and subscriptions, keyed by node id.
#[derive(Default)]
pub struct Registry {
    connections: DashMap<NodeId, Arc<Connection>>,
    descriptors: DashMap<NodeId, NodeDescriptor>,
    subscriptions: DashMap<NodeId, Vec<SubscriptionEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly announced node: its descriptor and live connection.
    pub fn register_node(&self, id: NodeId, descriptor: NodeDescriptor, conn: Arc<Connection>) {
        self.connections.insert(id, conn);
        self.descriptors.insert(id, descriptor);
    }

    /// Drop a node's connection entry and descriptor.
    pub fn unregister_node(&self, id: NodeId) {
        self.connections.remove(&id);
        self.descriptors.remove(&id);
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn get_connection(&self, id: NodeId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| c.clone())
    }

    pub fn get_descriptor(&self, id: NodeId) -> Option<NodeDescriptor> {
        self.descriptors.get(&id).map(|d| d.clone())
    }

    /// Best-effort point-to-point send. Absent or closed target: log and
    /// drop, never surfaced to the sender. Returns whether the frame was
    /// handed to the target's sink.
    pub fn send_to(&self, target: NodeId, packet: &Packet) -> bool {
        let Some(conn) = self.get_connection(target) else {
            debug!(node = %target, msg_type = ?packet.header().msg_type(), "target not connected, dropping");
            return false;
        };
        match conn.send(packet) {
            Ok(()) => true,
            Err(e) => {
                warn!(node = %target, error = %e, "send failed, dropping");
                false
            }
        }
    }

    /// Fan a data report out to every subscriber of its source node. Each
    /// subscriber gets its own freshly addressed packet; a single inbound
    /// report becomes N individually targeted sends, not a broadcast.
    /// Returns the number of deliveries handed off.
    pub fn send_to_subscribers(&self, packet: &Packet) -> usize {
        let source = packet.header().source();
        let mut delivered = 0;
        for entry in self.subscriptions.iter() {
            let subscriber = *entry.key();
            if !entry.value().iter().any(|s| s.node_id == source) {
                continue;
            }
            let copy = packet.retargeted(subscriber);
            if self.send_to(subscriber, &copy) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Replace a subscriber's whole entry set (not incremental).
    pub fn set_subscriptions(&self, subscriber: NodeId, entries: Vec<SubscriptionEntry>) {
        self.subscriptions.insert(subscriber, entries);
    }

    /// Clear a subscriber's entry set.
    pub fn remove_subscriptions(&self, subscriber: NodeId) {
        self.subscriptions.remove(&subscriber);
    }

    pub fn get_subscriptions(&self, subscriber: NodeId) -> Option<Vec<SubscriptionEntry>> {
        self.subscriptions.get(&subscriber).map(|s| s.clone())
    }

    /// Snapshot of every registered field-device descriptor, for answering
    /// capability queries.
    pub fn get_server_node_descriptors(&self) -> Vec<NodeDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.node_type == NodeType::SensorNode)
            .map(|d| d.clone())
            .collect()
    }

    /// Best-effort send to every connected node; per-socket failures are
    /// logged and do not abort the remaining sends.
    pub fn broadcast(&self, packet: &Packet) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            match entry.value().send(packet) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(node = %entry.key(), error = %e, "broadcast send failed"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{Body, DataReport};
    use crate::header::MsgType;
    use crate::node::NodeType;
    use crate::testutil::{descriptor, VecSink};

    fn report_from(source: NodeId) -> Packet {
        Packet::new(
            MsgType::DataReport,
            source,
            crate::node::SERVER,
            Body::DataReport(DataReport {
                request_id: 0,
                readings: vec![],
            }),
        )
        .unwrap()
    }

    fn subscribed(registry: &Registry, subscriber: NodeId, to: NodeId) -> Arc<VecSink> {
        let sink = Arc::new(VecSink::new());
        let conn = Arc::new(Connection::new(sink.clone()));
        conn.set_node_id(subscriber);
        registry.register_node(subscriber, descriptor(NodeType::ControlPanel), conn);
        registry.set_subscriptions(
            subscriber,
            vec![SubscriptionEntry {
                node_id: to,
                sensors: None,
                actuators: None,
            }],
        );
        sink
    }

    #[test]
    fn register_then_unregister() {
        let registry = Registry::new();
        let conn = Arc::new(Connection::new(Arc::new(VecSink::new())));
        registry.register_node(NodeId(5), descriptor(NodeType::SensorNode), conn);
        assert!(registry.has_node(NodeId(5)));
        assert!(registry.get_descriptor(NodeId(5)).is_some());
        registry.unregister_node(NodeId(5));
        assert!(!registry.has_node(NodeId(5)));
        assert!(registry.get_connection(NodeId(5)).is_none());
        assert!(registry.get_descriptor(NodeId(5)).is_none());
    }

    #[test]
    fn send_to_missing_target_drops() {
        let registry = Registry::new();
        assert!(!registry.send_to(NodeId(99), &report_from(NodeId(0x10007))));
    }

    #[test]
    fn fan_out_hits_only_matching_subscribers() {
        let registry = Registry::new();
        let a = subscribed(&registry, NodeId(2), NodeId(0x10007));
        let b = subscribed(&registry, NodeId(3), NodeId(0x10007));
        let c = subscribed(&registry, NodeId(4), NodeId(0x10009));

        let delivered = registry.send_to_subscribers(&report_from(NodeId(0x10007)));
        assert_eq!(delivered, 2);
        assert_eq!(a.frames().len(), 1);
        assert_eq!(b.frames().len(), 1);
        assert!(c.frames().is_empty());

        // Each copy is individually addressed.
        assert_eq!(a.packets()[0].header().target(), NodeId(2));
        assert_eq!(b.packets()[0].header().target(), NodeId(3));
        assert_eq!(a.packets()[0].header().source(), NodeId(0x10007));
    }

    #[test]
    fn subscriptions_replace_wholesale() {
        let registry = Registry::new();
        let _sink = subscribed(&registry, NodeId(2), NodeId(0x10007));
        registry.set_subscriptions(
            NodeId(2),
            vec![SubscriptionEntry {
                node_id: NodeId(0x10009),
                sensors: Some(vec!["temp".into()]),
                actuators: None,
            }],
        );
        let subs = registry.get_subscriptions(NodeId(2)).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].node_id, NodeId(0x10009));
        registry.remove_subscriptions(NodeId(2));
        assert!(registry.get_subscriptions(NodeId(2)).is_none());
    }

    #[test]
    fn descriptor_snapshot_filters_field_devices() {
        let registry = Registry::new();
        registry.register_node(
            NodeId(0x10001),
            descriptor(NodeType::SensorNode),
            Arc::new(Connection::new(Arc::new(VecSink::new()))),
        );
        registry.register_node(
            NodeId(2),
            descriptor(NodeType::ControlPanel),
            Arc::new(Connection::new(Arc::new(VecSink::new()))),
        );
        let snapshot = registry.get_server_node_descriptors();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].node_type, NodeType::SensorNode);
    }

    #[test]
    fn broadcast_reaches_every_connection() {
        let registry = Registry::new();
        let a = subscribed(&registry, NodeId(2), NodeId(0x10007));
        let b = subscribed(&registry, NodeId(3), NodeId(0x10009));
        let delivered = registry.broadcast(&report_from(NodeId(0x10007)));
        assert_eq!(delivered, 2);
        assert_eq!(a.frames().len(), 1);
        assert_eq!(b.frames().len(), 1);
    }

    #[test]
    fn closed_sink_failure_does_not_abort_broadcast() {
        let registry = Registry::new();
        let closed = Arc::new(VecSink::closed());
        let conn = Arc::new(Connection::new(closed));
        registry.register_node(NodeId(2), descriptor(NodeType::ControlPanel), conn);
        let live = subscribed(&registry, NodeId(3), NodeId(0x10007));
        let delivered = registry.broadcast(&report_from(NodeId(0x10007)));
        assert_eq!(delivered, 1);
        assert_eq!(live.frames().len(), 1);
    }
}
