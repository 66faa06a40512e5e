//! NERV relay peer endpoint.
//!
//! Listens on `peer.listen`, answers handshakes and logs post-handshake
//! traffic until Ctrl-C.

use tracing_subscriber::{fmt, EnvFilter};

use nerv_relay::{config, NervContext, PeerServer};

#[tokio::main]
async fn main() -> nerv_core::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "nerv.yaml".to_owned());
    let cfg = config::load_from_file(&path)?;
    let listen = cfg.peer.listen.clone();

    let ctx = NervContext::new(cfg)?;
    let server = PeerServer::new(ctx)?;
    let _ = server.router().on_receive(|env| {
        tracing::info!(
            source = %env.source(),
            target = %env.target(),
            kind = %env.kind(),
            action = %env.action(),
            correlation_id = %env.correlation_id(),
            "envelope"
        );
    });

    let listener = PeerServer::bind(&listen).await?;
    tracing::info!(%listen, config = %path, "nerv-relay starting");

    tokio::select! {
        res = server.serve(listener) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("nerv-relay shutting down");
            Ok(())
        }
    }
}
