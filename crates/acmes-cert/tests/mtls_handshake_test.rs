//! Handshake tests for the root-derived mTLS configurations

use acmes_cert::{client_tls_config, server_tls_config, Authority, HostnameVerification};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::sync::Arc;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Run one handshake over an in-memory pipe and exchange a byte
async fn handshake(
    server: ServerConfig,
    client: ClientConfig,
    server_name: &str,
) -> (Result<(), String>, Result<(), String>) {
    let (client_io, server_io) = duplex(64 * 1024);
    let acceptor = TlsAcceptor::from(Arc::new(server));
    let connector = TlsConnector::from(Arc::new(client));
    let name = ServerName::try_from(server_name.to_string()).unwrap();

    let server_task = tokio::spawn(async move {
        let mut stream = acceptor.accept(server_io).await.map_err(|e| e.to_string())?;
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.map_err(|e| e.to_string())?;
        stream.write_all(&buf).await.map_err(|e| e.to_string())?;
        stream.flush().await.map_err(|e| e.to_string())?;
        Ok::<_, String>(())
    });

    let client_result = async {
        let mut stream = connector
            .connect(name, client_io)
            .await
            .map_err(|e| e.to_string())?;
        stream.write_all(b"x").await.map_err(|e| e.to_string())?;
        stream.flush().await.map_err(|e| e.to_string())?;
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.map_err(|e| e.to_string())?;
        Ok::<_, String>(())
    }
    .await;

    let server_result = server_task.await.unwrap();
    (client_result, server_result)
}

#[tokio::test]
async fn test_mutual_auth_with_shared_root() {
    let authority = Authority::generate("acmes", 30).unwrap();
    let server = server_tls_config(&authority, &["acmes.internal".to_string()]).unwrap();
    let client = client_tls_config(&authority, HostnameVerification::Strict).unwrap();

    let (client_result, server_result) = handshake(server, client, "acmes.internal").await;
    assert!(client_result.is_ok(), "client: {:?}", client_result);
    assert!(server_result.is_ok(), "server: {:?}", server_result);
}

#[tokio::test]
async fn test_skip_policy_ignores_server_name() {
    let authority = Authority::generate("acmes", 30).unwrap();
    let server = server_tls_config(&authority, &["acmes.internal".to_string()]).unwrap();
    let client = client_tls_config(&authority, HostnameVerification::Skip).unwrap();

    let (client_result, server_result) = handshake(server, client, "10.0.0.7.nip.io").await;
    assert!(client_result.is_ok(), "client: {:?}", client_result);
    assert!(server_result.is_ok(), "server: {:?}", server_result);
}

#[tokio::test]
async fn test_strict_policy_rejects_name_mismatch() {
    let authority = Authority::generate("acmes", 30).unwrap();
    let server = server_tls_config(&authority, &["acmes.internal".to_string()]).unwrap();
    let client = client_tls_config(&authority, HostnameVerification::Strict).unwrap();

    let (client_result, _) = handshake(server, client, "other.internal").await;
    assert!(client_result.is_err());
}

#[tokio::test]
async fn test_skip_policy_still_rejects_foreign_root() {
    let server_authority = Authority::generate("acmes", 30).unwrap();
    let client_authority = Authority::generate("acmes", 30).unwrap();
    let server = server_tls_config(&server_authority, &["acmes.internal".to_string()]).unwrap();
    let client = client_tls_config(&client_authority, HostnameVerification::Skip).unwrap();

    let (client_result, server_result) = handshake(server, client, "acmes.internal").await;
    assert!(client_result.is_err());
    assert!(server_result.is_err());
}

#[tokio::test]
async fn test_server_rejects_client_without_certificate() {
    let authority = Authority::generate("acmes", 30).unwrap();
    let server = server_tls_config(&authority, &["acmes.internal".to_string()]).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(authority.root_der().clone()).unwrap();
    let client = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();

    let (_, server_result) = handshake(server, client, "acmes.internal").await;
    assert!(server_result.is_err());
}
