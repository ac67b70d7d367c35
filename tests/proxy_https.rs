mod support;

use std::sync::Arc;

use chacha::interceptor::TlsInterceptor;
use chacha::server::Options;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, ServerName};
use support::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

async fn read_head(stream: &mut TcpStream) -> String {
    let mut buf = vec![0u8; 4096];
    let mut acc = Vec::new();
    loop {
        let n = stream.read(&mut buf).await.expect("read");
        if n == 0 {
            break;
        }
        acc.extend_from_slice(&buf[..n]);
        if acc.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&acc).into_owned()
}

#[tokio::test]
async fn test_connect_without_interceptor_is_rejected() {
    let addr = start_proxy(Options::default()).await;

    let mut stream = TcpStream::connect(&addr).await.expect("connect");
    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .expect("write");

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 405"), "unexpected response: {head}");
}

#[tokio::test]
async fn test_connect_to_non_tls_port_is_rejected() {
    let (ca_cert, ca_key) = generate_test_ca();
    let interceptor = TlsInterceptor::from_pem(&ca_cert, &ca_key).expect("interceptor");

    let addr = start_proxy(Options {
        tls_interceptor: Some(interceptor),
        ..Default::default()
    })
    .await;

    let mut stream = TcpStream::connect(&addr).await.expect("connect");
    stream
        .write_all(b"CONNECT example.com:8443 HTTP/1.1\r\nHost: example.com:8443\r\n\r\n")
        .await
        .expect("write");

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 406"), "unexpected response: {head}");
}

#[tokio::test]
async fn test_connect_tunnel_reaches_the_internal_handler() {
    let (ca_cert, ca_key) = generate_test_ca();
    let interceptor = TlsInterceptor::from_pem(&ca_cert, &ca_key).expect("interceptor");

    let addr = start_proxy(Options {
        tls_interceptor: Some(interceptor),
        ..Default::default()
    })
    .await;

    // Establish the tunnel
    let mut stream = TcpStream::connect(&addr).await.expect("connect");
    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .expect("write");
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected response: {head}");

    // Handshake against the minted per-host leaf, trusting only our CA
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from_pem_slice(ca_cert.as_bytes()).expect("CA der"))
        .expect("add CA");
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from("example.com").expect("server name");
    let mut tls = connector.connect(server_name, stream).await.expect("TLS handshake");

    // A loopback request inside the tunnel lands on the regular dispatcher
    let request = format!("GET /health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    tls.write_all(request.as_bytes()).await.expect("write request");

    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
    assert!(response.contains("healthy"), "unexpected response: {response}");
}
