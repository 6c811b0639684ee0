//! Device/panel-side connector: TLS with a pinned trust store, the announce
//! and subscribe handshakes, and a decoded-packet event feed for the host
//! application (UI, sensor loop) to consume.

use std::io::BufReader;
use std::sync::Arc;

use anyhow::{bail, Context};
use fieldnet_core::body::{
    self, Body, Command, DataReport, SensorReading, Subscribe, SubscriptionEntry, Unsubscribe,
};
use fieldnet_core::{Header, MsgType, NodeDescriptor, NodeId, Packet, HEADER_LEN, SERVER};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::debug;

const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// A connection to the coordinator. Inbound packets surface through
/// [`Client::next_packet`]; handshake helpers filter what they wait for and
/// queue everything else for the feed.
pub struct Client {
    node_id: Option<NodeId>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    events: mpsc::UnboundedReceiver<Packet>,
    backlog: std::collections::VecDeque<Packet>,
    next_request_id: u32,
}

impl Client {
    /// Connect over TLS, validating the server certificate against the
    /// supplied PEM trust store only — never the system roots.
    pub async fn connect(addr: &str, server_name: &str, ca_pem: &str) -> anyhow::Result<Self> {
        let roots = pinned_roots(ca_pem)?;
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let tcp = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect {addr}"))?;
        let name = ServerName::try_from(server_name.to_owned()).context("invalid server name")?;
        let stream = connector.connect(name, tcp).await.context("TLS handshake")?;
        Ok(Self::from_stream(stream))
    }

    /// Connect to the plaintext sensor-facing bridge deployment variant.
    pub async fn connect_plain(addr: &str) -> anyhow::Result<Self> {
        let tcp = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect {addr}"))?;
        Ok(Self::from_stream(tcp))
    }

    fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (event_tx, events) = mpsc::unbounded_channel::<Packet>();

        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            loop {
                let mut header_buf = [0u8; HEADER_LEN];
                if reader.read_exact(&mut header_buf).await.is_err() {
                    break;
                }
                let payload_len = match Header::peek_payload_len(&header_buf) {
                    Ok(n) => n,
                    Err(_) => break,
                };
                if payload_len > MAX_PAYLOAD_LEN {
                    debug!(payload_len, "declared payload exceeds limit, closing connection");
                    break;
                }
                let mut body_buf = vec![0u8; payload_len as usize];
                if reader.read_exact(&mut body_buf).await.is_err() {
                    break;
                }
                match Packet::from_parts(&header_buf, &body_buf) {
                    Ok(packet) => {
                        if event_tx.send(packet).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "undecodable packet skipped"),
                }
            }
        });

        Self {
            node_id: None,
            tx,
            events,
            backlog: std::collections::VecDeque::new(),
            next_request_id: 1,
        }
    }

    /// Id assigned by the server at announce time, if announced.
    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Send a pre-built packet.
    pub fn send(&self, packet: &Packet) -> anyhow::Result<()> {
        let frame = packet.to_bytes()?;
        self.tx
            .send(frame)
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }

    /// Next inbound packet: backlog first, then the live feed. `None` once
    /// the connection is gone.
    pub async fn next_packet(&mut self) -> Option<Packet> {
        if let Some(p) = self.backlog.pop_front() {
            return Some(p);
        }
        self.events.recv().await
    }

    /// Wait for the packet `matcher` accepts; everything else joins the
    /// backlog in arrival order.
    async fn wait_for<T>(
        &mut self,
        matcher: impl Fn(&Packet) -> Option<T>,
    ) -> anyhow::Result<T> {
        loop {
            let Some(packet) = self.events.recv().await else {
                bail!("connection closed while waiting for reply");
            };
            match matcher(&packet) {
                Some(value) => return Ok(value),
                None => self.backlog.push_back(packet),
            }
        }
    }

    /// Announce this node and wait for the ack; the assigned id comes from
    /// the ack header's target. There is no built-in retry — callers that
    /// never see the ack re-announce at their own pace.
    pub async fn announce(&mut self, descriptor: NodeDescriptor) -> anyhow::Result<NodeId> {
        let request_id = self.next_request_id();
        let packet = Packet::new(
            MsgType::Announce,
            NodeId(0),
            SERVER,
            Body::Announce(body::Announce {
                request_id,
                descriptor,
            }),
        )?;
        self.send(&packet)?;
        let (id, status) = self
            .wait_for(|p| match p.body() {
                Body::AnnounceAck(ack) if ack.request_id == request_id => {
                    Some((p.header().target(), ack.status))
                }
                _ => None,
            })
            .await?;
        if status != fieldnet_core::STATUS_OK {
            bail!("announce rejected with status {status}");
        }
        self.node_id = Some(id);
        Ok(id)
    }

    /// Replace this subscriber's entry set; returns the batch id.
    pub async fn subscribe(&mut self, entries: Vec<SubscriptionEntry>) -> anyhow::Result<u32> {
        let source = self.announced()?;
        let request_id = self.next_request_id();
        let packet = Packet::new(
            MsgType::Subscribe,
            source,
            SERVER,
            Body::Subscribe(Subscribe {
                request_id,
                entries,
            }),
        )?;
        self.send(&packet)?;
        let (subscription_id, status) = self
            .wait_for(|p| match p.body() {
                Body::SubscribeAck(ack) if ack.request_id == request_id => {
                    Some((ack.subscription_id, ack.status))
                }
                _ => None,
            })
            .await?;
        if status != fieldnet_core::STATUS_OK {
            bail!("subscribe rejected with status {status}");
        }
        Ok(subscription_id)
    }

    /// Clear this subscriber's entry set.
    pub async fn unsubscribe(&mut self) -> anyhow::Result<()> {
        let source = self.announced()?;
        let request_id = self.next_request_id();
        let packet = Packet::new(
            MsgType::Unsubscribe,
            source,
            SERVER,
            Body::Unsubscribe(Unsubscribe { request_id }),
        )?;
        self.send(&packet)?;
        self.wait_for(|p| match p.body() {
            Body::UnsubscribeAck(ack) if ack.request_id == request_id => Some(()),
            _ => None,
        })
        .await
    }

    /// Push an unsolicited data report to the coordinator.
    pub fn send_report(&mut self, readings: Vec<SensorReading>) -> anyhow::Result<()> {
        let source = self.announced()?;
        let request_id = self.next_request_id();
        let packet = Packet::new(
            MsgType::DataReport,
            source,
            SERVER,
            Body::DataReport(DataReport {
                request_id,
                readings,
            }),
        )?;
        self.send(&packet)
    }

    /// Address a command at a specific device; returns the request id so the
    /// caller can correlate the eventual CommandAck from the feed.
    pub fn send_command(
        &mut self,
        target: NodeId,
        actuator_id: &str,
        value: f64,
    ) -> anyhow::Result<u32> {
        let source = self.announced()?;
        let request_id = self.next_request_id();
        let packet = Packet::new(
            MsgType::Command,
            source,
            target,
            Body::Command(Command {
                request_id,
                actuator_id: actuator_id.to_owned(),
                value,
            }),
        )?;
        self.send(&packet)?;
        Ok(request_id)
    }

    fn announced(&self) -> anyhow::Result<NodeId> {
        self.node_id
            .ok_or_else(|| anyhow::anyhow!("not announced yet"))
    }
}

/// Trust store holding only the caller-supplied roots.
fn pinned_roots(ca_pem: &str) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let mut reader = BufReader::new(ca_pem.as_bytes());
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.context("parse pinned certificate")?)?;
    }
    if roots.is_empty() {
        bail!("no certificates in pinned trust store");
    }
    Ok(roots)
}
