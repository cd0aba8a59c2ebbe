//! End-to-end PSK-TLS 1.2 loopback handshake, exercising `TlsAcceptor`
//! against a real OpenSSL client with its own PSK client callback — the
//! only way to prove the `ex_data`-carried per-connection outcome actually
//! threads through a live handshake rather than through a unit stand-in.

use std::sync::Arc;
use std::time::Duration;

use gpram::keystore::{KeyStore, SqliteKeyStore};
use gpram::tls::cipher::{CipherSuite, CompiledCipherPolicy};
use gpram::tls::TlsAcceptor;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::net::TcpListener;

const IDENTITY: &str = "unit-test-device";
const SECRET: &[u8] = b"0123456789abcdef";

fn client_connector(identity: &'static str, secret: &'static [u8]) -> SslConnector {
    let mut builder = SslConnector::builder(SslMethod::tls()).unwrap();
    builder.set_verify(SslVerifyMode::NONE);
    builder
        .set_cipher_list("PSK-AES128-CBC-SHA256")
        .unwrap();
    builder
        .set_min_proto_version(Some(openssl::ssl::SslVersion::TLS1_2))
        .unwrap();
    builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
        let id_bytes = identity.as_bytes();
        identity_out[..id_bytes.len()].copy_from_slice(id_bytes);
        identity_out[id_bytes.len()] = 0;
        psk_out[..secret.len()].copy_from_slice(secret);
        Ok(secret.len())
    });
    builder.build()
}

#[tokio::test]
async fn known_identity_completes_handshake_with_matching_cipher() {
    let sqlite = SqliteKeyStore::new("memory");
    sqlite.insert(IDENTITY, SECRET.to_vec());
    let keystore: Arc<dyn KeyStore> = Arc::new(sqlite);

    let policy = CompiledCipherPolicy::compile(vec![CipherSuite::Aes128CbcSha256]);
    let acceptor = TlsAcceptor::new(policy, Duration::from_secs(5), keystore).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, peer) = listener.accept().await.unwrap();
        acceptor.accept(tcp, peer).await
    });

    let client = tokio::task::spawn_blocking(move || {
        let connector = client_connector(IDENTITY, SECRET);
        let tcp = std::net::TcpStream::connect(addr).unwrap();
        connector.connect("localhost", tcp).unwrap();
    });

    let (server_result, client_result) = tokio::join!(server, client);
    client_result.expect("client task panicked");
    let (_, tls_info) = server_result.expect("server task panicked").expect("handshake failed");

    assert_eq!(tls_info.identity, IDENTITY);
    assert!(!tls_info.is_null_cipher);
    assert_eq!(tls_info.cipher, CipherSuite::Aes128CbcSha256);
}

#[tokio::test]
async fn unknown_identity_is_rejected_without_completing() {
    let keystore: Arc<dyn KeyStore> = Arc::new(SqliteKeyStore::new("memory"));
    let policy = CompiledCipherPolicy::compile(vec![CipherSuite::Aes128CbcSha256]);
    let acceptor = TlsAcceptor::new(policy, Duration::from_secs(5), keystore).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, peer) = listener.accept().await.unwrap();
        acceptor.accept(tcp, peer).await
    });

    let client = tokio::task::spawn_blocking(move || {
        let connector = client_connector("nobody-knows-this-one", SECRET);
        let tcp = std::net::TcpStream::connect(addr).unwrap();
        // Expected to fail: the server has no PSK for this identity.
        let _ = connector.connect("localhost", tcp);
    });

    let (server_result, _client_result) = tokio::join!(server, client);
    let outcome = server_result.expect("server task panicked");
    assert!(outcome.is_err());
}
