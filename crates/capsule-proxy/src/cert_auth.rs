//! Client certificate identity for mTLS
//!
//! When the proxy terminates mutual TLS, a caller without a bearer token is
//! identified by the subject of its client certificate: the username comes
//! from the configured subject attribute (Common Name by default) and the
//! groups from the Organization attributes. The proxy then impersonates that
//! identity towards the control plane.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tracing::debug;
use x509_parser::oid_registry::{OID_PKCS9_EMAIL_ADDRESS, OID_X509_COMMON_NAME};
use x509_parser::x509::X509Name;

use crate::auth::UserIdentity;
use crate::error::{Error, Result};

/// Subject attribute used as the username
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UsernameClaim {
    /// Common Name (`CN`)
    #[default]
    CommonName,
    /// Email address (`emailAddress`)
    EmailAddress,
}

impl FromStr for UsernameClaim {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CN" | "commonName" => Ok(UsernameClaim::CommonName),
            "emailAddress" | "email" => Ok(UsernameClaim::EmailAddress),
            other => Err(Error::Config(format!(
                "unsupported username claim {:?}, expected CN or emailAddress",
                other
            ))),
        }
    }
}

impl fmt::Display for UsernameClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsernameClaim::CommonName => f.write_str("CN"),
            UsernameClaim::EmailAddress => f.write_str("emailAddress"),
        }
    }
}

/// Extracts user identity from client certificates
#[derive(Clone, Debug, Default)]
pub struct CertValidator {
    claim: UsernameClaim,
}

impl CertValidator {
    /// Create a validator reading the username from `claim`
    pub fn new(claim: UsernameClaim) -> Self {
        Self { claim }
    }

    /// Identity of the single certificate presented by the peer
    ///
    /// Returns `None` unless exactly one certificate was presented.
    pub fn identity_from_chain(&self, chain: &ClientCertChain) -> Option<Result<UserIdentity>> {
        match chain.0.as_slice() {
            [cert] => Some(self.extract_identity(cert)),
            certs => {
                debug!(count = certs.len(), "Ignoring peer certificates, expected exactly one");
                None
            }
        }
    }

    /// Extract user identity from a DER-encoded certificate
    pub fn extract_identity(&self, cert: &CertificateDer<'_>) -> Result<UserIdentity> {
        let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
            .map_err(|e| Error::Unauthorized(format!("cannot parse client certificate: {}", e)))?;

        let subject = parsed.subject();
        let username = self.username(subject).ok_or_else(|| {
            Error::Unauthorized(format!("client certificate subject has no {}", self.claim))
        })?;

        let groups = subject
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect::<Vec<_>>();

        debug!(username = %username, groups = ?groups, "Extracted identity from client certificate");

        Ok(UserIdentity { username, groups })
    }

    fn username(&self, subject: &X509Name<'_>) -> Option<String> {
        let oid = match self.claim {
            UsernameClaim::CommonName => &OID_X509_COMMON_NAME,
            UsernameClaim::EmailAddress => &OID_PKCS9_EMAIL_ADDRESS,
        };
        subject
            .iter_by_oid(oid)
            .next()
            .and_then(|v| v.as_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

/// Client certificate chain captured from the TLS connection
///
/// Stored as a request extension so handlers can access it.
#[derive(Clone, Debug, Default)]
pub struct ClientCertChain(pub Vec<CertificateDer<'static>>);

impl ClientCertChain {
    /// Create from the peer certificates of a TLS session
    pub fn new(certs: Vec<CertificateDer<'static>>) -> Self {
        Self(certs)
    }
}

/// Verifier requesting, but not requiring, a client certificate signed by `roots`
pub fn optional_client_cert_verifier(roots: RootCertStore) -> Result<Arc<dyn ClientCertVerifier>> {
    WebPkiClientVerifier::builder(Arc::new(roots))
        .allow_unauthenticated()
        .build()
        .map_err(|e| Error::Config(format!("cannot build client certificate verifier: {}", e)))
}
