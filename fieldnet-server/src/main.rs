// FieldNet coordinator: TLS listener, packet routing, subscription fan-out.

mod config;
mod server;
mod tls;

use std::sync::Arc;

use anyhow::Context;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("fieldnet-server {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let cert_pem = std::fs::read_to_string(&cfg.cert_path)
        .with_context(|| format!("read certificate {}", cfg.cert_path.display()))?;
    let key_pem = std::fs::read_to_string(&cfg.key_path)
        .with_context(|| format!("read private key {}", cfg.key_path.display()))?;
    let tls_config = tls::create_server_config(&cert_pem, &key_pem)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let ctx = Arc::new(fieldnet_core::ServerContext::new());
    let dispatcher = Arc::new(fieldnet_core::default_dispatcher());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listen_addr: std::net::SocketAddr = format!("0.0.0.0:{}", cfg.listen_port).parse()?;
        tokio::spawn(server::run_tls_listener(
            listen_addr,
            acceptor,
            ctx.clone(),
            dispatcher.clone(),
        ));
        if let Some(bridge_port) = cfg.bridge_port {
            let bridge_addr: std::net::SocketAddr = format!("0.0.0.0:{}", bridge_port).parse()?;
            tokio::spawn(server::run_bridge_listener(
                bridge_addr,
                ctx.clone(),
                dispatcher.clone(),
            ));
        }
        shutdown_signal().await
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix); tasks exit with the runtime.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
