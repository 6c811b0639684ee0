//! Listeners and per-connection packet loops.
//!
//! One task per connection runs a blocking-style read loop; all outbound
//! frames for a connection funnel through a single writer task fed by an
//! unbounded channel, so handler-thread sends and the connection's own acks
//! never interleave mid-frame on the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use fieldnet_core::registry::{Connection, PacketSink, SinkClosed};
use fieldnet_core::{Dispatcher, Header, Packet, ServerContext, HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Outbound side of one connection: frames go to the writer task.
struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl PacketSink for ChannelSink {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), SinkClosed> {
        self.tx.send(frame).map_err(|_| SinkClosed)
    }
}

/// Accept loop for the encrypted listener. The TLS handshake completes
/// before any protocol bytes are read.
pub async fn run_tls_listener(
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    ctx: Arc<ServerContext>,
    dispatcher: Arc<Dispatcher<ServerContext>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "TLS listener up");
    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let ctx = ctx.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(tls) => run_connection(tls, ctx, dispatcher).await,
                Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
            }
        });
    }
}

/// Accept loop for the plaintext sensor-facing bridge deployment variant.
pub async fn run_bridge_listener(
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
    dispatcher: Arc<Dispatcher<ServerContext>>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "plaintext bridge listener up");
    loop {
        let (stream, _peer) = listener.accept().await?;
        let ctx = ctx.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(run_connection(stream, ctx, dispatcher));
    }
}

/// One connection's lifetime: read 33 header bytes, read the declared
/// payload, decode, dispatch, repeat. Truncated headers and bad magic close
/// the connection (stream position unrecoverable); undecodable packets are
/// skipped because the declared payload was already consumed. On exit the
/// announced node id, if any, is unregistered; the id is retired rather
/// than returned to the allocator.
pub async fn run_connection<S>(
    stream: S,
    ctx: Arc<ServerContext>,
    dispatcher: Arc<Dispatcher<ServerContext>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let conn = Arc::new(Connection::new(Arc::new(ChannelSink { tx })));

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    loop {
        let mut header_buf = [0u8; HEADER_LEN];
        if reader.read_exact(&mut header_buf).await.is_err() {
            // Orderly close or truncated header; either way we are done.
            break;
        }
        let payload_len = match Header::peek_payload_len(&header_buf) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "unrecoverable framing error, closing connection");
                break;
            }
        };
        if payload_len > MAX_PAYLOAD_LEN {
            warn!(payload_len, "declared payload exceeds limit, closing connection");
            break;
        }
        let mut body_buf = vec![0u8; payload_len as usize];
        if reader.read_exact(&mut body_buf).await.is_err() {
            warn!(payload_len, "connection closed mid-body");
            break;
        }
        match Packet::from_parts(&header_buf, &body_buf) {
            Ok(packet) => dispatcher.dispatch(&packet, &conn, &ctx),
            // Payload already consumed, stream position is still valid.
            Err(e) => debug!(error = %e, "undecodable packet skipped"),
        }
    }

    if let Some(id) = conn.node_id() {
        ctx.registry.unregister_node(id);
        ctx.registry.remove_subscriptions(id);
        info!(node_id = %id, "node disconnected");
    }
    writer_task.abort();
}
