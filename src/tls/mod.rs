//! TLS handling module
//!
//! This module holds the two handshake endpoints of an intercepted session:
//! the terminator facing the client and the connector facing the upstream.

mod acceptor;
mod connector;
pub(crate) mod identity;

pub use acceptor::TlsTerminator;
pub use connector::UpstreamConnector;
pub use identity::TlsIdentity;

use openssl::ssl::SslRef;
use openssl::x509::X509VerifyResult;

/// Describe a failed handshake, including the certificate verification
/// result when that is what failed
pub(crate) fn describe_ssl_error(error: &openssl::ssl::Error, ssl: &SslRef) -> String {
    let verify = ssl.verify_result();
    if verify != X509VerifyResult::OK {
        format!("{} (certificate verification: {})", error, verify.error_string())
    } else {
        format!("{}", error)
    }
}
