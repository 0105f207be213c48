//! HTTP listeners.
//!
//! The bridge runs zero, one or two of these: a plain listener served by
//! `axum::serve`, and a TLS listener with its own accept loop that hands each
//! decrypted stream to hyper. Both stop accepting when the shutdown token is
//! cancelled.

use crate::auth::{BasicCredentials, GateGuard};
use crate::config::TlsPaths;
use crate::handlers::{AppState, StaticAssets, build_router};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Certificate error: {0}")]
    Certificate(String),
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// What to bind and how to serve it.
#[derive(Debug, Clone)]
pub struct ListenerSpec {
    /// Used in logs only.
    pub name: &'static str,
    pub host: String,
    pub port: u16,
    /// Present for the TLS listener.
    pub tls: Option<TlsPaths>,
    /// Fixed HTTP Basic credentials in place of session cookies.
    pub basic: Option<BasicCredentials>,
}

impl ListenerSpec {
    pub fn plain(host: &str, port: u16) -> Self {
        Self {
            name: "http",
            host: host.to_string(),
            port,
            tls: None,
            basic: None,
        }
    }

    pub fn tls(host: &str, port: u16, paths: TlsPaths, basic: Option<BasicCredentials>) -> Self {
        Self {
            name: "https",
            host: host.to_string(),
            port,
            tls: Some(paths),
            basic,
        }
    }

    fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A bound listener and the task serving it.
pub struct RunningListener {
    pub name: &'static str,
    pub local_addr: SocketAddr,
    pub task: JoinHandle<()>,
}

/// Bind and start serving. Returns once the socket is bound.
pub async fn start(
    spec: ListenerSpec,
    state: AppState,
    assets: &StaticAssets,
) -> Result<RunningListener, ListenerError> {
    // Certificates are loaded before binding so a bad key never holds a port.
    let acceptor = spec.tls.as_ref().map(build_acceptor).transpose()?;

    let addr = spec.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ListenerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ListenerError::Bind { addr, source })?;

    let shutdown = state.shutdown.clone();
    let guard = GateGuard::new(state.gate.clone()).with_basic(spec.basic.clone());
    let app = build_router(state, guard, assets);

    let task = match acceptor {
        None => tokio::spawn(serve_plain(listener, app, shutdown)),
        Some(acceptor) => tokio::spawn(serve_tls(listener, acceptor, app, shutdown)),
    };

    info!(
        "Listening ({}) on {}{}",
        spec.name,
        local_addr,
        if spec.basic.is_some() {
            " with HTTP Basic auth"
        } else {
            ""
        }
    );

    Ok(RunningListener {
        name: spec.name,
        local_addr,
        task,
    })
}

async fn serve_plain(listener: TcpListener, app: Router, shutdown: CancellationToken) {
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        error!("HTTP listener failed: {}", e);
    }
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept error: {}", e);
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };

            let builder = Builder::new(TokioExecutor::new());
            let conn = builder
                .serve_connection_with_upgrades(TokioIo::new(tls_stream), TowerToHyperService::new(app));
            tokio::select! {
                result = conn => {
                    if let Err(e) = result {
                        debug!("TLS connection with {} ended: {}", peer, e);
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }
    debug!("TLS listener stopped accepting");
}

/// Load the PEM certificate chain and private key into a TLS acceptor.
pub fn build_acceptor(paths: &TlsPaths) -> Result<TlsAcceptor, ListenerError> {
    let certs = rustls_pemfile::certs(&mut open_pem(&paths.cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            ListenerError::Certificate(format!(
                "failed to parse certificates in {:?}: {}",
                paths.cert_path, e
            ))
        })?;
    if certs.is_empty() {
        return Err(ListenerError::Certificate(format!(
            "no certificates found in {:?}",
            paths.cert_path
        )));
    }

    let key = rustls_pemfile::private_key(&mut open_pem(&paths.key_path)?)
        .map_err(|e| {
            ListenerError::Certificate(format!(
                "failed to parse private key in {:?}: {}",
                paths.key_path, e
            ))
        })?
        .ok_or_else(|| {
            ListenerError::Certificate(format!("no private key found in {:?}", paths.key_path))
        })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ListenerError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open_pem(path: &Path) -> Result<BufReader<File>, ListenerError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ListenerError::Certificate(format!("failed to open {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{SessionGate, SessionStore};
    use crate::store::MemoryStore;
    use crate::sync::{BroadcastHub, MirrorCache};
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn app_state() -> AppState {
        let store = Arc::new(MemoryStore::new());
        AppState {
            hub: Arc::new(BroadcastHub::new(
                Arc::new(MirrorCache::new(16)),
                store.clone(),
            )),
            gate: Arc::new(SessionGate::new(
                false,
                store,
                SessionStore::new(chrono::Duration::hours(1)),
            )),
            shutdown: CancellationToken::new(),
        }
    }

    fn assets() -> StaticAssets {
        StaticAssets {
            root: PathBuf::from("./does-not-exist"),
            cache: false,
        }
    }

    #[test]
    fn test_missing_certificate_is_reported() {
        let paths = TlsPaths {
            cert_path: PathBuf::from("/nonexistent/certificate.pem"),
            key_path: PathBuf::from("/nonexistent/privatekey.pem"),
        };
        assert!(matches!(
            build_acceptor(&paths),
            Err(ListenerError::Certificate(_))
        ));
    }

    #[test]
    fn test_empty_certificate_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("certificate.pem");
        std::fs::write(&cert_path, "").unwrap();
        let paths = TlsPaths {
            cert_path,
            key_path: dir.path().join("privatekey.pem"),
        };
        let err = build_acceptor(&paths).err().unwrap();
        assert!(err.to_string().contains("no certificates"));
    }

    #[tokio::test]
    async fn test_tls_listener_with_bad_certificate_binds_nothing() {
        let spec = ListenerSpec::tls(
            "127.0.0.1",
            0,
            TlsPaths {
                cert_path: PathBuf::from("/nonexistent/certificate.pem"),
                key_path: PathBuf::from("/nonexistent/privatekey.pem"),
            },
            None,
        );
        let result = start(spec, app_state(), &assets()).await;
        assert!(matches!(result, Err(ListenerError::Certificate(_))));
    }

    #[tokio::test]
    async fn test_port_in_use_is_a_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = start(ListenerSpec::plain("127.0.0.1", port), app_state(), &assets()).await;
        assert!(matches!(result, Err(ListenerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_plain_listener_serves_and_releases_port() {
        let state = app_state();
        let shutdown = state.shutdown.clone();
        let running = start(ListenerSpec::plain("127.0.0.1", 0), state, &assets())
            .await
            .unwrap();

        let mut stream = tokio::net::TcpStream::connect(running.local_addr)
            .await
            .unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("OK"));

        shutdown.cancel();
        running.task.await.unwrap();
        TcpListener::bind(running.local_addr).await.unwrap();
    }
}
