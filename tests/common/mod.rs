//! Shared fixtures for the integration tests
//!
//! Certificates are generated at runtime: a test CA plus a `localhost` leaf
//! it signs, written into a temporary directory.

#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_openssl::SslStream;

use companion_tap::common::{shutdown_channel, ShutdownTrigger};
use companion_tap::config::TapConfig;
use companion_tap::relay::{RelayContext, RelayServer};

/// Key and certificate pair
pub struct Issued {
    pub cert: X509,
    pub key: PKey<Private>,
}

/// A CA, a `localhost` leaf signed by it, and their files on disk
pub struct TestPki {
    pub dir: TempDir,
    pub ca: Issued,
    pub leaf: Issued,
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

impl TestPki {
    pub fn new() -> Self {
        let ca = build_ca("companion test CA");
        let leaf = build_leaf(&ca, "localhost");
        let dir = tempfile::tempdir().unwrap();

        let ca_file = dir.path().join("ca.crt");
        let cert_file = dir.path().join("server.crt");
        let key_file = dir.path().join("server.key");
        std::fs::write(&ca_file, ca.cert.to_pem().unwrap()).unwrap();
        std::fs::write(&cert_file, leaf.cert.to_pem().unwrap()).unwrap();
        std::fs::write(&key_file, leaf.key.private_key_to_pem_pkcs8().unwrap()).unwrap();

        Self { dir, ca, leaf, ca_file, cert_file, key_file }
    }

    /// Path inside the fixture directory
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn name(cn: &str) -> openssl::x509::X509Name {
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    name.build()
}

fn serial() -> openssl::asn1::Asn1Integer {
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    serial.to_asn1_integer().unwrap()
}

pub fn build_ca(cn: &str) -> Issued {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let subject = name(cn);

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial()).unwrap();
    builder.set_subject_name(&subject).unwrap();
    builder.set_issuer_name(&subject).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(2).unwrap()).unwrap();
    builder.append_extension(BasicConstraints::new().critical().ca().build().unwrap()).unwrap();
    builder
        .append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    Issued { cert: builder.build(), key }
}

pub fn build_leaf(ca: &Issued, host: &str) -> Issued {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial()).unwrap();
    builder.set_subject_name(&name(host)).unwrap();
    builder.set_issuer_name(ca.cert.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    builder.append_extension(BasicConstraints::new().build().unwrap()).unwrap();
    builder
        .append_extension(KeyUsage::new().digital_signature().key_encipherment().build().unwrap())
        .unwrap();
    builder.append_extension(ExtendedKeyUsage::new().server_auth().build().unwrap()).unwrap();
    let san = SubjectAlternativeName::new()
        .dns(host)
        .ip("127.0.0.1")
        .build(&builder.x509v3_context(Some(&ca.cert), None))
        .unwrap();
    builder.append_extension(san).unwrap();
    builder.sign(&ca.key, MessageDigest::sha256()).unwrap();

    Issued { cert: builder.build(), key }
}

/// What the upstream stub saw on one connection
#[derive(Debug)]
pub enum UpstreamEvent {
    Received(Vec<u8>),
    Closed,
}

/// TLS upstream stub
///
/// Reports every chunk it receives and answers each `PING` chunk with `PONG`.
pub async fn spawn_upstream(identity: &Issued) -> (SocketAddr, mpsc::UnboundedReceiver<UpstreamEvent>) {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
    builder.set_certificate(&identity.cert).unwrap();
    builder.set_private_key(&identity.key).unwrap();
    let acceptor = Arc::new(builder.build());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (events, receiver) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let (tcp, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let acceptor = Arc::clone(&acceptor);
            let events = events.clone();
            tokio::spawn(async move {
                let ssl = openssl::ssl::Ssl::new(acceptor.context()).unwrap();
                let mut stream = SslStream::new(ssl, tcp).unwrap();
                if Pin::new(&mut stream).accept().await.is_err() {
                    return;
                }
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let _ = events.send(UpstreamEvent::Received(buf[..n].to_vec()));
                            if &buf[..n] == b"PING" && stream.write_all(b"PONG").await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = events.send(UpstreamEvent::Closed);
            });
        }
    });

    (addr, receiver)
}

/// Relay configuration pointing at `upstream`, trusting the fixture CA
pub fn relay_config(pki: &TestPki, upstream: SocketAddr) -> TapConfig {
    TapConfig {
        relay_listen: "127.0.0.1:0".parse().unwrap(),
        upstream_host: "localhost".to_string(),
        upstream_port: upstream.port(),
        upstream_connect_addr: Some(upstream),
        upstream_ca_file: Some(pki.ca_file.clone()),
        cert: Some(pki.cert_file.clone()),
        key: Some(pki.key_file.clone()),
        capture_prefix: Some(format!("{}/captures/session-", pki.dir.path().display())),
        handshake_timeout_ms: 2_000,
        shutdown_grace_secs: 1,
        ..TapConfig::default()
    }
}

/// A running relay
pub struct RunningRelay {
    pub addr: SocketAddr,
    pub trigger: ShutdownTrigger,
    pub task: tokio::task::JoinHandle<companion_tap::Result<()>>,
}

impl RunningRelay {
    pub async fn stop(self) {
        self.trigger.trigger();
        tokio::time::timeout(std::time::Duration::from_secs(5), self.task)
            .await
            .expect("relay did not stop")
            .unwrap()
            .unwrap();
    }
}

pub async fn start_relay(config: TapConfig) -> RunningRelay {
    config.validate().unwrap();
    let ctx = Arc::new(RelayContext::from_config(Arc::new(config)).unwrap());
    let server = RelayServer::from_listener(TcpListener::bind("127.0.0.1:0").await.unwrap(), ctx);
    let addr = server.local_addr().unwrap();
    let (trigger, signal) = shutdown_channel();
    let task = tokio::spawn(server.run(signal));
    RunningRelay { addr, trigger, task }
}

/// Connect to the relay as a client trusting `ca_file`
pub async fn tls_client(addr: SocketAddr, ca_file: &Path) -> Result<SslStream<TcpStream>, openssl::ssl::Error> {
    let mut builder = SslConnector::builder(SslMethod::tls_client()).unwrap();
    builder.set_ca_file(ca_file).unwrap();
    let ssl = builder.build().configure().unwrap().into_ssl("localhost").unwrap();
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = SslStream::new(ssl, tcp).unwrap();
    Pin::new(&mut stream).connect().await?;
    Ok(stream)
}

/// Next chunk the upstream received, skipping close notifications
pub async fn next_received(events: &mut mpsc::UnboundedReceiver<UpstreamEvent>) -> Vec<u8> {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(UpstreamEvent::Received(bytes)) => return bytes,
                Some(UpstreamEvent::Closed) => continue,
                None => panic!("upstream stub stopped"),
            }
        }
    })
    .await
    .expect("upstream received nothing")
}

/// Poll `path` until it holds `expected`
pub async fn wait_for_file(path: &Path, expected: &[u8]) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if let Ok(bytes) = std::fs::read(path) {
            if bytes == expected {
                return;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "{} never held {:?} (has {:?})",
                path.display(),
                String::from_utf8_lossy(expected),
                std::fs::read(path).ok().map(|b| String::from_utf8_lossy(&b).into_owned())
            );
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
