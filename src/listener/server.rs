use super::handler::HandlerChain;
use super::ListenerError;
use crate::config::TlsMinVersion;
use crate::timeouts::{LISTENER_ACCEPT_BACKOFF, TLS_HANDSHAKE_TIMEOUT};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use log::{debug, info, warn};
use parking_lot::RwLock;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;

/// Hands every handshake the certificate installed most recently.
pub struct CertResolver {
    current: RwLock<Arc<CertifiedKey>>,
}

impl CertResolver {
    pub fn new(initial: CertifiedKey) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn swap(&self, next: CertifiedKey) {
        *self.current.write() = Arc::new(next);
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.read().clone())
    }
}

pub fn server_config(
    resolver: Arc<CertResolver>,
    min_version: TlsMinVersion,
) -> Result<ServerConfig, ListenerError> {
    let versions: &[&'static rustls::SupportedProtocolVersion] = match min_version {
        TlsMinVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
        TlsMinVersion::Tls13 => &[&rustls::version::TLS13],
    };
    let mut config = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(versions)?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Accepts until `cancel` fires, then asks open connections to finish their
/// in-flight requests and waits for all of them before returning.
pub(crate) async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handlers: HandlerChain,
    cancel: CancellationToken,
) {
    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("event=listener_accept_error error={err}");
                        tokio::time::sleep(LISTENER_ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                tracker.spawn(serve_connection(
                    stream,
                    peer,
                    acceptor.clone(),
                    handlers.clone(),
                    cancel.clone(),
                ));
            }
        }
    }
    drop(listener);
    tracker.close();
    info!("event=listener_draining connections={}", tracker.len());
    tracker.wait().await;
    info!("event=listener_stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    handlers: HandlerChain,
    cancel: CancellationToken,
) {
    let tls = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(err)) => {
            debug!("event=listener_handshake_failed peer={peer} error={err}");
            return;
        }
        Err(_) => {
            debug!("event=listener_handshake_timeout peer={peer}");
            return;
        }
    };

    let service = service_fn(move |request: Request<Incoming>| {
        let router = handlers.current();
        async move { router.oneshot(request).await }
    });
    let builder = Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(tls), service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(err) = result {
                debug!("event=listener_connection_error peer={peer} error={err}");
            }
            return;
        }
        _ = cancel.cancelled() => {
            connection.as_mut().graceful_shutdown();
        }
    }
    if let Err(err) = connection.await {
        debug!("event=listener_connection_error peer={peer} error={err}");
    }
}
