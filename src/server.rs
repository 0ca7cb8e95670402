//! HTTP listeners for the registry and metrics endpoints.
//!
//! Connections are served by hyper's auto (HTTP/1 and HTTP/2) builder,
//! optionally behind rustls.  A client that does not finish sending its
//! request head within the header read timeout is disconnected.  On shutdown
//! the accept loop stops, every open connection is asked to finish its
//! in-flight requests, and [`serve`] returns once they have.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::TlsConfig;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind `listen` for the server called `name`.
pub async fn bind(name: &'static str, listen: &str) -> Result<TcpListener> {
    let listen_addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid {name} listen address"))?;
    TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {name} listener on {listen_addr}"))
}

/// Build a TLS acceptor from the PEM certificate chain and private key named
/// in `config`.
pub fn load_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let certs = CertificateDer::pem_file_iter(&config.cert_file)
        .with_context(|| format!("failed to open certificate file: {}", config.cert_file))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid certificate file: {}", config.cert_file))?;
    ensure!(
        !certs.is_empty(),
        "no certificates found in {}",
        config.cert_file
    );

    let key = PrivateKeyDer::from_pem_file(&config.key_file)
        .with_context(|| format!("no usable private key in {}", config.key_file))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("unsupported TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate does not match private key")?;
    tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls)))
}

/// Accept connections on `listener` until `shutdown` is cancelled, then wait
/// for open connections to drain.
pub async fn serve(
    name: &'static str,
    listener: TcpListener,
    app: Router,
    tls: Option<TlsAcceptor>,
    header_read_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout((!header_read_timeout.is_zero()).then_some(header_read_timeout));
    let builder = Arc::new(builder);
    let connections = TaskTracker::new();

    info!(
        listen_addr = %listener.local_addr()?,
        server = name,
        tls = tls.is_some(),
        "HTTP server listening"
    );

    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(server = name, error = %e, "failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        connections.spawn(handle_connection(
            stream,
            peer,
            tls.clone(),
            app.clone(),
            Arc::clone(&builder),
            shutdown.clone(),
        ));
    }

    connections.close();
    debug!(server = name, open = connections.len(), "draining connections");
    connections.wait().await;
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    app: Router,
    builder: Arc<auto::Builder<TokioExecutor>>,
    shutdown: CancellationToken,
) {
    let result = match tls {
        None => drive(stream, app, &builder, &shutdown).await,
        Some(acceptor) => {
            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => drive(stream, app, &builder, &shutdown).await,
                Ok(Err(e)) => {
                    debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(%peer, "TLS handshake timed out");
                    return;
                }
            }
        }
    };

    if let Err(e) = result {
        debug!(%peer, error = %e, "connection closed with error");
    }
}

async fn drive<I>(
    io: I,
    app: Router,
    builder: &auto::Builder<TokioExecutor>,
    shutdown: &CancellationToken,
) -> Result<(), BoxError>
where
    I: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let conn = builder.serve_connection(TokioIo::new(io), TowerToHyperService::new(app));
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => result,
        () = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
