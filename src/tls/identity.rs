//! Fixed TLS identity handling
//!
//! The identity presented to intercepted clients is loaded once at startup,
//! either from a PEM certificate chain plus private key or from a PKCS#12
//! bundle.

use log::{debug, info};
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use std::fs;
use std::path::Path;

use crate::common::{TapError, Result};
use crate::config::IdentitySource;

/// Certificate, intermediate chain and private key presented by the terminator
pub struct TlsIdentity {
    certificate: X509,
    chain: Vec<X509>,
    key: PKey<Private>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("subject", &self.subject())
            .field("chain", &self.chain.len())
            .field("key", &"<private key>")
            .finish()
    }
}

impl TlsIdentity {
    /// Load the identity described by the configuration
    pub fn load(source: &IdentitySource) -> Result<Self> {
        let identity = match source {
            IdentitySource::Pem { cert, key } => {
                debug!("Loading PEM identity: cert {:?}, key {:?}", cert, key);
                Self::from_pem(&read(cert)?, &read(key)?)?
            }
            IdentitySource::Pkcs12 { path, password } => {
                debug!("Loading PKCS#12 identity: {:?}", path);
                Self::from_pkcs12(&read(path)?, password.expose())?
            }
        };

        info!("Loaded TLS identity: {}", identity.subject());
        Ok(identity)
    }

    /// Build an identity from a PEM certificate chain and a PEM private key
    ///
    /// The first certificate is the leaf; any further ones are sent as the chain.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let mut certs = X509::stack_from_pem(cert_pem)
            .map_err(|e| TapError::Certificate(format!("Invalid PEM certificate: {}", e)))?;
        if certs.is_empty() {
            return Err(TapError::Certificate("No certificate found in PEM data".to_string()));
        }
        let certificate = certs.remove(0);

        let key = PKey::private_key_from_pem(key_pem)
            .map_err(|e| TapError::Certificate(format!("Invalid PEM private key: {}", e)))?;

        Self::assemble(certificate, certs, key)
    }

    /// Build an identity from a DER-encoded PKCS#12 bundle
    pub fn from_pkcs12(der: &[u8], password: &str) -> Result<Self> {
        let parsed = Pkcs12::from_der(der)
            .and_then(|p| p.parse2(password))
            .map_err(|e| TapError::Certificate(format!("Invalid PKCS#12 bundle: {}", e)))?;

        let certificate = parsed.cert.ok_or_else(|| {
            TapError::Certificate("PKCS#12 bundle has no certificate".to_string())
        })?;
        let key = parsed.pkey.ok_or_else(|| {
            TapError::Certificate("PKCS#12 bundle has no private key".to_string())
        })?;
        let chain = parsed.ca.into_iter().flatten().collect();

        Self::assemble(certificate, chain, key)
    }

    fn assemble(certificate: X509, chain: Vec<X509>, key: PKey<Private>) -> Result<Self> {
        let public = certificate.public_key()?;
        if !public.public_eq(&key) {
            return Err(TapError::Certificate(
                "Private key does not match certificate".to_string(),
            ));
        }

        Ok(Self { certificate, chain, key })
    }

    /// Leaf certificate
    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// Intermediate certificates sent after the leaf
    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    /// Private key matching the leaf certificate
    pub fn key(&self) -> &PKey<Private> {
        &self.key
    }

    /// Leaf subject as `CN=..., O=...`
    pub fn subject(&self) -> String {
        self.certificate
            .subject_name()
            .entries()
            .map(|entry| {
                let name = entry.object().nid().short_name().unwrap_or("?");
                let value = entry
                    .data()
                    .as_utf8()
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                format!("{}={}", name, value)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// SHA-256 fingerprint of the leaf, colon-separated hex
    pub fn fingerprint(&self) -> Result<String> {
        let digest = self.certificate.digest(MessageDigest::sha256())?;
        Ok(digest
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":"))
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        TapError::Certificate(format!("Failed to read {}: {}", path.display(), e))
    })
}
