//! Upstream connector: client-role TLS to the one fixed backend

use log::{debug, info};
use openssl::ssl::{SslConnector, SslMethod};
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;

use crate::common::{TapError, Result};
use crate::config::UpstreamTarget;
use super::describe_ssl_error;

/// Opens a fresh, verified TLS connection to the upstream per session
///
/// The peer chain is validated against the system trust store (plus an
/// optional extra CA bundle) and the configured hostname, which is also sent
/// as SNI. There is no retry.
pub struct UpstreamConnector {
    connector: SslConnector,
    target: UpstreamTarget,
    handshake_timeout: Duration,
}

impl UpstreamConnector {
    /// Create a connector for `target`
    pub fn new(
        target: UpstreamTarget,
        extra_ca_file: Option<&Path>,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())?;

        if let Some(ca) = extra_ca_file {
            debug!("Trusting extra upstream CA bundle: {}", ca.display());
            builder.set_ca_file(ca)?;
        }

        info!("Upstream connector ready for {}", target);

        Ok(Self {
            connector: builder.build(),
            target,
            handshake_timeout,
        })
    }

    /// Upstream this connector dials
    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Open the TCP connection to the upstream
    pub async fn dial(&self) -> Result<TcpStream> {
        let connect = async {
            match self.target.connect_addr {
                Some(addr) => TcpStream::connect(addr).await,
                None => TcpStream::connect((self.target.host.as_str(), self.target.port)).await,
            }
        };

        let stream = timeout(self.handshake_timeout, connect)
            .await
            .map_err(|_| TapError::IoTimeout {
                stage: "upstream connect",
                after: self.handshake_timeout,
            })??;
        stream.set_nodelay(true)?;

        debug!("Connected to upstream {}", self.target.dial_target());
        Ok(stream)
    }

    /// Perform the client-role handshake over an already connected stream
    pub async fn handshake<S>(&self, stream: S) -> Result<SslStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ssl = self.connector.configure()?.into_ssl(&self.target.host)?;
        let mut stream = SslStream::new(ssl, stream)?;

        match timeout(self.handshake_timeout, Pin::new(&mut stream).connect()).await {
            Ok(Ok(())) => {
                debug!(
                    "Upstream handshake complete: {} / {}",
                    stream.ssl().version_str(),
                    stream.ssl().current_cipher().map(|c| c.name()).unwrap_or("?")
                );
                Ok(stream)
            }
            Ok(Err(e)) => Err(TapError::HandshakeFailure {
                stage: "upstream handshake",
                message: describe_ssl_error(&e, stream.ssl()),
            }),
            Err(_) => Err(TapError::HandshakeFailure {
                stage: "upstream handshake",
                message: format!("timed out after {:?}", self.handshake_timeout),
            }),
        }
    }

    /// Dial and handshake
    pub async fn connect(&self) -> Result<SslStream<TcpStream>> {
        let tcp = self.dial().await?;
        self.handshake(tcp).await
    }
}
