//! Handshake and forwarding state machines the coordinator runs per packet.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use tracing::{debug, info, warn};

use crate::body::{self, Body, STATUS_FAILED, STATUS_OK};
use crate::dispatch::Dispatcher;
use crate::header::MsgType;
use crate::node::{NodeId, NodeIdAllocator, SERVER};
use crate::packet::Packet;
use crate::registry::{Connection, Registry};

/// Shared coordinator state, constructed once at startup and passed by
/// reference into every connection task. Replaces any notion of
/// process-wide static registries.
pub struct ServerContext {
    pub registry: Registry,
    allocator: Mutex<NodeIdAllocator>,
    subscription_batch: AtomicU32,
}

impl ServerContext {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            allocator: Mutex::new(NodeIdAllocator::new()),
            subscription_batch: AtomicU32::new(1),
        }
    }

    pub fn allocate_node_id(&self) -> NodeId {
        // A poisoned lock means another handler panicked mid-allocate;
        // carry on with the allocator state as-is.
        match self.allocator.lock() {
            Ok(mut a) => a.allocate(),
            Err(poisoned) => poisoned.into_inner().allocate(),
        }
    }

    /// Monotonically increasing subscription-batch id.
    pub fn next_subscription_id(&self) -> u32 {
        self.subscription_batch.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ServerContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the coordinator's handler table: announce, subscribe/unsubscribe,
/// data-report fan-out, capability queries, and point-to-point forwarding
/// for commands, acks, errors, data requests and image transfer messages.
pub fn default_dispatcher() -> Dispatcher<ServerContext> {
    let mut d = Dispatcher::new();
    d.register(MsgType::Announce, handle_announce);
    d.register(MsgType::Subscribe, handle_subscribe);
    d.register(MsgType::Unsubscribe, handle_unsubscribe);
    d.register(MsgType::DataReport, handle_data_report);
    d.register(MsgType::CapabilitiesQuery, handle_capabilities_query);
    d.register(MsgType::Command, handle_command);
    d.register(MsgType::CommandAck, handle_command);
    d.register(MsgType::Error, handle_error);
    d.register(MsgType::DataRequest, handle_forward);
    d.register(MsgType::ImageMetadata, handle_forward);
    d.register(MsgType::ImageChunk, handle_forward);
    d.register(MsgType::ImageTransferAck, handle_forward);
    d
}

/// Announce: allocate an id, register the connection with a descriptor copy
/// carrying that id, and ack. A device that never receives the ack must
/// re-announce; no retry is built in here.
fn handle_announce(
    packet: &Packet,
    conn: &Arc<Connection>,
    ctx: &ServerContext,
) -> anyhow::Result<()> {
    let Body::Announce(announce) = packet.body() else {
        anyhow::bail!("announce packet without announce body");
    };
    let id = ctx.allocate_node_id();
    let descriptor = announce.descriptor.with_node_id(id);
    conn.set_node_id(id);
    ctx.registry.register_node(id, descriptor, conn.clone());
    info!(node_id = %id, node_type = ?announce.descriptor.node_type, "node announced");

    let ack = Packet::new(
        MsgType::AnnounceAck,
        SERVER,
        id,
        Body::AnnounceAck(body::AnnounceAck {
            request_id: announce.request_id,
            status: STATUS_OK,
        }),
    )?;
    conn.send(&ack).context("send announce ack")?;
    Ok(())
}

/// Subscribe: replace the subscriber's whole entry set, keyed by its own
/// connection id, and ack with a fresh batch id.
fn handle_subscribe(
    packet: &Packet,
    conn: &Arc<Connection>,
    ctx: &ServerContext,
) -> anyhow::Result<()> {
    let Body::Subscribe(subscribe) = packet.body() else {
        anyhow::bail!("subscribe packet without subscribe body");
    };
    let Some(subscriber) = conn.node_id() else {
        warn!(source = %packet.header().source(), "subscribe before announce, rejecting");
        let nack = Packet::new(
            MsgType::SubscribeAck,
            SERVER,
            packet.header().source(),
            Body::SubscribeAck(body::SubscribeAck {
                request_id: subscribe.request_id,
                subscription_id: 0,
                status: STATUS_FAILED,
            }),
        )?;
        conn.send(&nack).context("send subscribe nack")?;
        return Ok(());
    };

    let subscription_id = ctx.next_subscription_id();
    ctx.registry
        .set_subscriptions(subscriber, subscribe.entries.clone());
    debug!(%subscriber, subscription_id, entries = subscribe.entries.len(), "subscriptions replaced");

    let ack = Packet::new(
        MsgType::SubscribeAck,
        SERVER,
        subscriber,
        Body::SubscribeAck(body::SubscribeAck {
            request_id: subscribe.request_id,
            subscription_id,
            status: STATUS_OK,
        }),
    )?;
    conn.send(&ack).context("send subscribe ack")?;
    Ok(())
}

fn handle_unsubscribe(
    packet: &Packet,
    conn: &Arc<Connection>,
    ctx: &ServerContext,
) -> anyhow::Result<()> {
    let Body::Unsubscribe(unsubscribe) = packet.body() else {
        anyhow::bail!("unsubscribe packet without unsubscribe body");
    };
    let status = match conn.node_id() {
        Some(subscriber) => {
            ctx.registry.remove_subscriptions(subscriber);
            debug!(%subscriber, "subscriptions cleared");
            STATUS_OK
        }
        None => STATUS_FAILED,
    };
    let ack = Packet::new(
        MsgType::UnsubscribeAck,
        SERVER,
        conn.node_id().unwrap_or(packet.header().source()),
        Body::UnsubscribeAck(body::UnsubscribeAck {
            request_id: unsubscribe.request_id,
            status,
        }),
    )?;
    conn.send(&ack).context("send unsubscribe ack")?;
    Ok(())
}

/// Data reports are unsolicited; fan out to current subscribers only, no
/// buffering for late joiners.
fn handle_data_report(
    packet: &Packet,
    _conn: &Arc<Connection>,
    ctx: &ServerContext,
) -> anyhow::Result<()> {
    let delivered = ctx.registry.send_to_subscribers(packet);
    debug!(source = %packet.header().source(), delivered, "data report fanned out");
    Ok(())
}

fn handle_capabilities_query(
    packet: &Packet,
    conn: &Arc<Connection>,
    ctx: &ServerContext,
) -> anyhow::Result<()> {
    let request_id = match packet.body() {
        Body::CapabilitiesQuery(q) => q.request_id,
        Body::None => 0,
        _ => anyhow::bail!("capabilities query with mismatched body"),
    };
    let nodes = ctx.registry.get_server_node_descriptors();
    let reply = Packet::new(
        MsgType::CapabilitiesList,
        SERVER,
        packet.header().source(),
        Body::CapabilitiesList(body::CapabilitiesList { request_id, nodes }),
    )?;
    conn.send(&reply).context("send capabilities list")?;
    Ok(())
}

/// Command and CommandAck are point-to-point. The server is never itself a
/// device executor: a command declared for the server is a misdirected
/// message and is dropped with a warning, not forwarded.
fn handle_command(
    packet: &Packet,
    _conn: &Arc<Connection>,
    ctx: &ServerContext,
) -> anyhow::Result<()> {
    let target = packet.header().target();
    if target.is_server() {
        warn!(
            msg_type = ?packet.header().msg_type(),
            source = %packet.header().source(),
            "command addressed to the server itself, dropping"
        );
        return Ok(());
    }
    ctx.registry.send_to(target, packet);
    Ok(())
}

/// Errors addressed to the server are logged locally; anything else is
/// forwarded verbatim.
fn handle_error(
    packet: &Packet,
    _conn: &Arc<Connection>,
    ctx: &ServerContext,
) -> anyhow::Result<()> {
    let target = packet.header().target();
    if target.is_server() {
        let Body::Error(err) = packet.body() else {
            anyhow::bail!("error packet without error body");
        };
        warn!(
            source = %packet.header().source(),
            code = err.code,
            message = %err.message,
            "error reported to server"
        );
        return Ok(());
    }
    ctx.registry.send_to(target, packet);
    Ok(())
}

/// Point-to-point forward to whatever connection is registered for the
/// declared target.
fn handle_forward(
    packet: &Packet,
    _conn: &Arc<Connection>,
    ctx: &ServerContext,
) -> anyhow::Result<()> {
    ctx.registry.send_to(packet.header().target(), packet);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{
        Announce, Command, DataReport, ErrorBody, Subscribe, SubscriptionEntry, Unsubscribe,
    };
    use crate::node::{NodeDescriptor, NodeType};
    use crate::testutil::{descriptor, VecSink};

    fn announced(
        ctx: &ServerContext,
        d: &Dispatcher<ServerContext>,
        node_type: NodeType,
    ) -> (Arc<Connection>, Arc<VecSink>, NodeId) {
        let sink = Arc::new(VecSink::new());
        let conn = Arc::new(Connection::new(sink.clone()));
        let packet = Packet::new(
            MsgType::Announce,
            NodeId(0),
            SERVER,
            Body::Announce(Announce {
                request_id: 10,
                descriptor: descriptor(node_type),
            }),
        )
        .unwrap();
        d.dispatch(&packet, &conn, ctx);
        let id = conn.node_id().expect("announce should assign an id");
        sink.clear();
        (conn, sink, id)
    }

    #[test]
    fn announce_allocates_registers_and_acks() {
        let ctx = ServerContext::new();
        let d = default_dispatcher();
        let sink = Arc::new(VecSink::new());
        let conn = Arc::new(Connection::new(sink.clone()));

        let descriptor = NodeDescriptor {
            node_id: None,
            node_type: NodeType::SensorNode,
            sensors: Some(vec![]),
            actuators: None,
            supports_images: true,
            supports_aggregates: false,
        };
        let packet = Packet::new(
            MsgType::Announce,
            NodeId(0),
            SERVER,
            Body::Announce(Announce {
                request_id: 10,
                descriptor: descriptor.clone(),
            }),
        )
        .unwrap();
        d.dispatch(&packet, &conn, &ctx);

        let id = conn.node_id().unwrap();
        assert!(ctx.registry.has_node(id));
        let stored = ctx.registry.get_descriptor(id).unwrap();
        assert_eq!(stored.node_id, Some(id));
        assert_eq!(stored.sensors, descriptor.sensors);
        assert_eq!(stored.supports_images, descriptor.supports_images);

        let acks = sink.packets();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].header().target(), id);
        match acks[0].body() {
            Body::AnnounceAck(a) => {
                assert_eq!(a.request_id, 10);
                assert_eq!(a.status, STATUS_OK);
            }
            other => panic!("expected AnnounceAck, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_acks_with_increasing_batch_ids_and_replaces() {
        let ctx = ServerContext::new();
        let d = default_dispatcher();
        let (conn, sink, id) = announced(&ctx, &d, NodeType::ControlPanel);

        let subscribe = |node: NodeId| {
            Packet::new(
                MsgType::Subscribe,
                id,
                SERVER,
                Body::Subscribe(Subscribe {
                    request_id: 1,
                    entries: vec![SubscriptionEntry {
                        node_id: node,
                        sensors: None,
                        actuators: None,
                    }],
                }),
            )
            .unwrap()
        };

        d.dispatch(&subscribe(NodeId(0x10007)), &conn, &ctx);
        d.dispatch(&subscribe(NodeId(0x10009)), &conn, &ctx);

        let acks = sink.packets();
        assert_eq!(acks.len(), 2);
        let ids: Vec<u32> = acks
            .iter()
            .map(|p| match p.body() {
                Body::SubscribeAck(a) => {
                    assert_eq!(a.status, STATUS_OK);
                    a.subscription_id
                }
                other => panic!("expected SubscribeAck, got {other:?}"),
            })
            .collect();
        assert!(ids[1] > ids[0]);

        // Second subscribe replaced the first wholesale.
        let subs = ctx.registry.get_subscriptions(id).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].node_id, NodeId(0x10009));
    }

    #[test]
    fn subscribe_before_announce_is_rejected() {
        let ctx = ServerContext::new();
        let d = default_dispatcher();
        let sink = Arc::new(VecSink::new());
        let conn = Arc::new(Connection::new(sink.clone()));
        let packet = Packet::new(
            MsgType::Subscribe,
            NodeId(0),
            SERVER,
            Body::Subscribe(Subscribe {
                request_id: 5,
                entries: vec![],
            }),
        )
        .unwrap();
        d.dispatch(&packet, &conn, &ctx);
        match sink.packets()[0].body() {
            Body::SubscribeAck(a) => assert_eq!(a.status, STATUS_FAILED),
            other => panic!("expected SubscribeAck, got {other:?}"),
        }
    }

    #[test]
    fn unsubscribe_clears_and_acks() {
        let ctx = ServerContext::new();
        let d = default_dispatcher();
        let (conn, sink, id) = announced(&ctx, &d, NodeType::ControlPanel);
        ctx.registry.set_subscriptions(
            id,
            vec![SubscriptionEntry {
                node_id: NodeId(0x10007),
                sensors: None,
                actuators: None,
            }],
        );
        let packet = Packet::new(
            MsgType::Unsubscribe,
            id,
            SERVER,
            Body::Unsubscribe(Unsubscribe { request_id: 8 }),
        )
        .unwrap();
        d.dispatch(&packet, &conn, &ctx);
        assert!(ctx.registry.get_subscriptions(id).is_none());
        match sink.packets()[0].body() {
            Body::UnsubscribeAck(a) => {
                assert_eq!(a.request_id, 8);
                assert_eq!(a.status, STATUS_OK);
            }
            other => panic!("expected UnsubscribeAck, got {other:?}"),
        }
    }

    #[test]
    fn data_report_fans_out_to_subscribers() {
        let ctx = ServerContext::new();
        let d = default_dispatcher();
        let (sensor_conn, _sensor_sink, sensor_id) = announced(&ctx, &d, NodeType::SensorNode);
        let (_a_conn, a_sink, a_id) = announced(&ctx, &d, NodeType::ControlPanel);
        ctx.registry.set_subscriptions(
            a_id,
            vec![SubscriptionEntry {
                node_id: sensor_id,
                sensors: None,
                actuators: None,
            }],
        );

        let report = Packet::new(
            MsgType::DataReport,
            sensor_id,
            SERVER,
            Body::DataReport(DataReport {
                request_id: 0,
                readings: vec![],
            }),
        )
        .unwrap();
        d.dispatch(&report, &sensor_conn, &ctx);
        let got = a_sink.packets();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].header().target(), a_id);
        assert_eq!(got[0].header().source(), sensor_id);
    }

    #[test]
    fn capabilities_query_answers_with_field_devices() {
        let ctx = ServerContext::new();
        let d = default_dispatcher();
        let (_sensor_conn, _s, sensor_id) = announced(&ctx, &d, NodeType::SensorNode);
        let (panel_conn, panel_sink, panel_id) = announced(&ctx, &d, NodeType::ControlPanel);

        let query = Packet::new(
            MsgType::CapabilitiesQuery,
            panel_id,
            SERVER,
            Body::CapabilitiesQuery(body::CapabilitiesQuery { request_id: 4 }),
        )
        .unwrap();
        d.dispatch(&query, &panel_conn, &ctx);

        match panel_sink.packets()[0].body() {
            Body::CapabilitiesList(list) => {
                assert_eq!(list.request_id, 4);
                assert_eq!(list.nodes.len(), 1);
                assert_eq!(list.nodes[0].node_id, Some(sensor_id));
            }
            other => panic!("expected CapabilitiesList, got {other:?}"),
        }
    }

    #[test]
    fn command_for_server_is_dropped_not_forwarded() {
        let ctx = ServerContext::new();
        let d = default_dispatcher();
        let (panel_conn, panel_sink, panel_id) = announced(&ctx, &d, NodeType::ControlPanel);
        let (_sensor_conn, sensor_sink, _sensor_id) = announced(&ctx, &d, NodeType::SensorNode);

        let misdirected = Packet::new(
            MsgType::Command,
            panel_id,
            SERVER,
            Body::Command(Command {
                request_id: 2,
                actuator_id: "valve".into(),
                value: 0.5,
            }),
        )
        .unwrap();
        d.dispatch(&misdirected, &panel_conn, &ctx);
        assert!(panel_sink.frames().is_empty());
        assert!(sensor_sink.frames().is_empty());
    }

    #[test]
    fn command_forwarded_verbatim_to_target() {
        let ctx = ServerContext::new();
        let d = default_dispatcher();
        let (panel_conn, _panel_sink, panel_id) = announced(&ctx, &d, NodeType::ControlPanel);
        let (_sensor_conn, sensor_sink, sensor_id) = announced(&ctx, &d, NodeType::SensorNode);

        let command = Packet::new(
            MsgType::Command,
            panel_id,
            sensor_id,
            Body::Command(Command {
                request_id: 2,
                actuator_id: "valve".into(),
                value: 0.5,
            }),
        )
        .unwrap();
        d.dispatch(&command, &panel_conn, &ctx);
        let got = sensor_sink.packets();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].header().target(), sensor_id);
        assert_eq!(got[0].header().source(), panel_id);
        assert_eq!(got[0].body(), command.body());
        assert_eq!(
            got[0].header().correlation_id(),
            command.header().correlation_id()
        );
    }

    #[test]
    fn self_addressed_error_is_logged_not_forwarded() {
        let ctx = ServerContext::new();
        let d = default_dispatcher();
        let (sensor_conn, sensor_sink, sensor_id) = announced(&ctx, &d, NodeType::SensorNode);

        let error = Packet::new(
            MsgType::Error,
            sensor_id,
            SERVER,
            Body::Error(ErrorBody {
                code: 500,
                message: "actuator fault".into(),
            }),
        )
        .unwrap();
        d.dispatch(&error, &sensor_conn, &ctx);
        assert!(sensor_sink.frames().is_empty());
    }
}
