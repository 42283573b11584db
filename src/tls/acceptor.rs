//! TLS terminator: server-role handshake with the fixed identity

use log::{debug, info};
use openssl::ssl::{Ssl, SslAcceptor, SslMethod, SslVerifyMode};
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_openssl::SslStream;

use crate::common::{TapError, Result};
use super::identity::TlsIdentity;
use super::describe_ssl_error;

/// Terminates client TLS with the pre-issued certificate
///
/// Client certificates are neither requested nor verified.
pub struct TlsTerminator {
    acceptor: SslAcceptor,
    handshake_timeout: Duration,
}

impl TlsTerminator {
    /// Create a terminator presenting `identity`
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use std::time::Duration;
    /// # use companion_tap::config::IdentitySource;
    /// # use companion_tap::tls::{TlsIdentity, TlsTerminator};
    /// # fn main() -> companion_tap::Result<()> {
    /// let identity = TlsIdentity::load(&IdentitySource::Pem {
    ///     cert: "certs/server.crt".into(),
    ///     key: "certs/server.key".into(),
    /// })?;
    /// let terminator = TlsTerminator::new(&identity, Duration::from_secs(10))?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(identity: &TlsIdentity, handshake_timeout: Duration) -> Result<Self> {
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;

        builder.set_certificate(identity.certificate())?;
        for cert in identity.chain() {
            builder.add_extra_chain_cert(cert.clone())?;
        }
        builder.set_private_key(identity.key())?;
        builder.check_private_key()?;

        builder.set_verify(SslVerifyMode::NONE);
        info!("TLS terminator ready, presenting {}", identity.subject());

        Ok(Self {
            acceptor: builder.build(),
            handshake_timeout,
        })
    }

    /// Perform the server-role handshake on an accepted stream
    pub async fn accept<S>(&self, stream: S) -> Result<SslStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ssl = Ssl::new(self.acceptor.context())?;
        let mut stream = SslStream::new(ssl, stream)?;

        match timeout(self.handshake_timeout, Pin::new(&mut stream).accept()).await {
            Ok(Ok(())) => {
                debug!(
                    "Client handshake complete: {} / {}",
                    stream.ssl().version_str(),
                    stream.ssl().current_cipher().map(|c| c.name()).unwrap_or("?")
                );
                Ok(stream)
            }
            Ok(Err(e)) => Err(TapError::HandshakeFailure {
                stage: "client handshake",
                message: describe_ssl_error(&e, stream.ssl()),
            }),
            Err(_) => Err(TapError::HandshakeFailure {
                stage: "client handshake",
                message: format!("timed out after {:?}", self.handshake_timeout),
            }),
        }
    }
}
