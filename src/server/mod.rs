//! Hub server: TLS termination, accept loop, lifecycle.
//!
//! Each accepted stream completes a TLS handshake and then runs its own
//! session task. A watch channel carries the shutdown signal into every
//! session so writers are released before the process exits.

pub mod session;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::{rustls, TlsAcceptor};
use tracing::{debug, error, info, warn};

use crate::AppContext;

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let tls_config = load_tls_config(&ctx.config.tls_cert, &ctx.config.tls_key)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let addr = ctx.config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "Synapse hub listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sessions: JoinSet<()> = JoinSet::new();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received, closing sessions and stopping accept loop");
                let _ = shutdown_tx.send(true);
                break;
            }

            // Reap finished session tasks so the set does not grow unbounded.
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(err) => {
                        error!(err = %err, "accept error");
                        continue;
                    }
                };

                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                let acceptor = acceptor.clone();
                let shutdown_rx = shutdown_rx.clone();
                sessions.spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls) => {
                            let (reader, writer) = tokio::io::split(tls);
                            session::run_session(ctx, reader, writer, peer.to_string(), shutdown_rx)
                                .await;
                        }
                        Err(err) => warn!(peer = %peer, err = %err, "TLS handshake failed"),
                    }
                });
            }
        }
    }

    // Sessions observe the shutdown watch and release their writers.
    while sessions.join_next().await.is_some() {}
    info!("hub stopped");
    Ok(())
}

fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path).with_context(
        || format!("failed to open TLS certificate {}", cert_path.display()),
    )?))
    .collect::<Result<Vec<_>, _>>()
    .context("failed to parse TLS certificate")?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", cert_path.display()));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path).with_context(
        || format!("failed to open TLS key {}", key_path.display()),
    )?))
    .context("failed to parse TLS key")?
    .ok_or_else(|| anyhow!("no private key found in {}", key_path.display()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate/key pair")
}

/// Wait for an interrupt: Ctrl-C everywhere, plus SIGTERM on Unix.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(err) => {
            warn!(err = %err, "SIGTERM handler unavailable, watching Ctrl-C only");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
