//! mTLS listener serving the acmes router
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

pub struct AcmesServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
}

impl AcmesServer {
    /// Bind the listener; the TLS config must require client certificates
    pub async fn bind(
        bind_addr: SocketAddr,
        tls_config: ServerConfig,
        router: Router,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            let port = bind_addr.port();
            let address = bind_addr.ip().to_string();
            let reason = e.to_string();
            ServerError::BindError {
                address,
                port,
                reason,
            }
        })?;

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            router,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!("acmes server listening on {}", self.local_addr()?);

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("acmes server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let acceptor = self.acceptor.clone();
                        let router = self.router.clone();

                        tokio::spawn(async move {
                            if let Err(e) =
                                Self::handle_connection(stream, peer_addr, acceptor, router).await
                            {
                                debug!("Connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    /// Accept connections forever
    pub async fn serve(self) -> Result<(), ServerError> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        acceptor: TlsAcceptor,
        router: Router,
    ) -> Result<(), ServerError> {
        debug!("New connection from {}", peer_addr);

        let tls_stream = match acceptor.accept(stream).await {
            Ok(s) => s,
            Err(e) => {
                warn!("TLS handshake failed from {}: {}", peer_addr, e);
                return Err(ServerError::TlsError(format!("Handshake failed: {}", e)));
            }
        };

        debug!("TLS handshake completed for {}", peer_addr);

        http1::Builder::new()
            .serve_connection(TokioIo::new(tls_stream), TowerToHyperService::new(router))
            .await
            .map_err(|e| ServerError::HttpError(e.to_string()))
    }
}
