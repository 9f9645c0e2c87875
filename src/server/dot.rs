//! DNS-over-TLS listener (RFC 7858).
//!
//! TCP framing inside TLS, ALPN `dot`, TLS 1.2 minimum. The server
//! certificate comes from a per-handshake resolver so rotation by the
//! certificate collaborator needs no restart. In dev mode the DoT port
//! speaks plaintext TCP instead.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context as _, Result};
use tokio::net::TcpListener;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::{self, CertifiedKey};
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::tcp::serve_stream;
use crate::dispatcher::Dispatcher;

/// DoT DNS server; plaintext TCP when built without an acceptor.
pub struct DotServer {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
}

impl DotServer {
    /// Bind a DoT listener. `cert_resolver` is consulted on every
    /// handshake.
    pub async fn bind(addr: SocketAddr, cert_resolver: Arc<dyn ResolvesServerCert>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind DoT listener on {addr}"))?;

        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(cert_resolver);
        config.alpn_protocols = vec![b"dot".to_vec()];

        Ok(Self {
            listener,
            acceptor: Some(TlsAcceptor::from(Arc::new(config))),
        })
    }

    /// Bind the DoT port as plaintext TCP (dev mode).
    pub async fn bind_plain(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind DoT listener on {addr}"))?;
        Ok(Self { listener, acceptor: None })
    }

    /// Accept connections forever, serving each in its own task.
    pub async fn run(self, dispatcher: Arc<Dispatcher>) -> Result<()> {
        let addr = self.listener.local_addr()?;
        match &self.acceptor {
            Some(_) => info!(addr = %addr, "DoT server listening"),
            None => warn!(addr = %addr, "DoT server listening in dev mode (plain TCP)"),
        }

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "DoT accept error");
                    continue;
                }
            };

            let dispatcher = Arc::clone(&dispatcher);
            let acceptor = self.acceptor.clone();
            tokio::spawn(async move {
                let served = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_stream(tls_stream, Some(peer), dispatcher).await,
                        Err(err) => {
                            debug!(peer = %peer, error = %err, "TLS handshake failed");
                            return;
                        }
                    },
                    None => serve_stream(stream, Some(peer), dispatcher).await,
                };
                if let Err(err) = served {
                    debug!(peer = %peer, error = %err, "DoT connection closed with error");
                }
            });
        }
    }
}

/// Certificate resolver backed by PEM files under the certificate cache
/// directory (`<host>.crt` / `<host>.key` per allowed host).
///
/// Picks the certificate matching the SNI, falling back to the first
/// allowed host when the client sends none.
pub struct CertCache {
    certs: Vec<(String, Arc<CertifiedKey>)>,
}

impl CertCache {
    pub fn load(dir: &Path, hosts: &[String]) -> Result<Self> {
        ensure!(
            !hosts.is_empty(),
            "at least one allowed host is required for the DoT certificate"
        );

        let mut certs = Vec::with_capacity(hosts.len());
        for host in hosts {
            let chain = load_certificates(&dir.join(format!("{host}.crt")))?;
            let key = load_private_key(&dir.join(format!("{host}.key")))?;
            let signing_key = sign::any_supported_type(&key)
                .map_err(|_| anyhow!("unsupported private key type for host {host}"))?;
            certs.push((host.clone(), Arc::new(CertifiedKey::new(chain, signing_key))));
        }
        Ok(Self { certs })
    }
}

impl ResolvesServerCert for CertCache {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(sni) = client_hello.server_name() {
            for (host, key) in &self.certs {
                if host == sni {
                    return Some(Arc::clone(key));
                }
            }
        }
        self.certs.first().map(|(_, key)| Arc::clone(key))
    }
}

fn load_certificates(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path)
        .with_context(|| format!("unable to open certificate file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .with_context(|| format!("failed to parse certificates from {}", path.display()))?;
    ensure!(!certs.is_empty(), "no certificates found in {}", path.display());
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let file = File::open(path)
        .with_context(|| format!("unable to open private key file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .with_context(|| format!("failed to parse private key from {}", path.display()))?;
    if let Some(key) = keys.pop() {
        return Ok(PrivateKey(key));
    }

    // Retry as RSA for keys generated with older tooling.
    let file = File::open(path)
        .with_context(|| format!("unable to open private key file {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut keys = rustls_pemfile::rsa_private_keys(&mut reader)
        .with_context(|| format!("failed to parse private key from {}", path.display()))?;
    keys.pop()
        .map(PrivateKey)
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}
