//! Startup configuration
//!
//! Every flag can also be set through an environment variable. Files named by
//! the flags are read once at startup; nothing is reloaded afterwards.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::Args;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use zeroize::Zeroizing;

use crate::cert_auth::{CertValidator, UsernameClaim};
use crate::error::{Error, Result};
use crate::k8s_forwarder::{CA_CERT_PATH, TOKEN_PATH};

/// Proxy flags
#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    /// Port the proxy listens on
    #[arg(long, env = "CAPSULE_PROXY_PORT", default_value_t = 9001)]
    pub port: u16,

    /// URL of the API server requests are forwarded to
    #[arg(long, env = "CAPSULE_PROXY_UPSTREAM", default_value = "https://kubernetes.default.svc")]
    pub upstream: String,

    /// CA bundle trusted for the API server
    #[arg(long, env = "CAPSULE_PROXY_UPSTREAM_CA", default_value = CA_CERT_PATH)]
    pub upstream_ca: PathBuf,

    /// File holding the token the proxy authenticates to the API server with;
    /// a missing file leaves callers' own credentials in place
    #[arg(long, env = "CAPSULE_PROXY_BEARER_TOKEN_FILE", default_value = TOKEN_PATH)]
    pub bearer_token_file: PathBuf,

    /// Group whose members get tenant-scoped responses
    #[arg(long, env = "CAPSULE_USER_GROUP", default_value = "capsule.clastix.io")]
    pub capsule_user_group: String,

    /// Client certificate subject field used as the username (CN or emailAddress)
    #[arg(long, env = "CAPSULE_PROXY_USERNAME_CLAIM", default_value = "CN")]
    pub username_claim: String,

    /// Serve HTTPS instead of plain HTTP
    #[arg(long, env = "CAPSULE_PROXY_ENABLE_TLS")]
    pub enable_tls: bool,

    /// Server certificate (PEM)
    #[arg(long, env = "CAPSULE_PROXY_TLS_CERT", default_value = "tls.crt")]
    pub tls_cert: PathBuf,

    /// Server private key (PEM)
    #[arg(long, env = "CAPSULE_PROXY_TLS_KEY", default_value = "tls.key")]
    pub tls_key: PathBuf,

    /// CA verifying client certificates; enables certificate impersonation
    #[arg(long, env = "CAPSULE_PROXY_CLIENT_CA")]
    pub client_ca: Option<PathBuf>,
}

/// Settings shared by every request handler
pub struct ProxySettings {
    /// Group whose members get tenant-scoped responses
    pub privileged_group: String,
    /// Credential the proxy presents to the API server
    pub bearer_token: Option<Zeroizing<String>>,
    /// Reads identities from client certificates
    pub certs: CertValidator,
    /// Whether the listener terminates TLS
    pub listening_tls: bool,
}

/// TLS listener material
pub struct TlsMaterial {
    /// Server certificate chain
    pub cert_chain: Vec<CertificateDer<'static>>,
    /// Server private key
    pub key: PrivateKeyDer<'static>,
    /// Roots verifying client certificates, if mutual TLS is enabled
    pub client_roots: Option<RootCertStore>,
}

/// Everything resolved from the flags
pub struct ServerConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// Upstream API server URL
    pub upstream: String,
    /// Upstream CA bundle, `None` to rely on system roots
    pub upstream_ca: Option<Vec<u8>>,
    /// TLS listener material, `None` for plain HTTP
    pub tls: Option<TlsMaterial>,
    /// Handler settings
    pub settings: ProxySettings,
}

impl ProxyArgs {
    /// Read every referenced file and validate the flags
    pub fn resolve(&self) -> Result<ServerConfig> {
        let claim: UsernameClaim = self.username_claim.parse()?;

        let bearer_token = read_token(&self.bearer_token_file)?;

        let upstream_ca = read_optional(&self.upstream_ca)?;

        let tls = if self.enable_tls {
            Some(TlsMaterial {
                cert_chain: load_certs(&self.tls_cert)?,
                key: load_key(&self.tls_key)?,
                client_roots: self.client_ca.as_deref().map(load_roots).transpose()?,
            })
        } else {
            None
        };

        Ok(ServerConfig {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)),
            upstream: self.upstream.clone(),
            upstream_ca,
            settings: ProxySettings {
                privileged_group: self.capsule_user_group.clone(),
                bearer_token,
                certs: CertValidator::new(claim),
                listening_tls: tls.is_some(),
            },
            tls,
        })
    }
}

/// Token from `path`; a missing file means no proxy credential
fn read_token(path: &Path) -> Result<Option<Zeroizing<String>>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let raw = Zeroizing::new(raw);
            let token = raw.trim();
            Ok((!token.is_empty()).then(|| Zeroizing::new(token.to_string())))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Config(format!(
            "cannot read bearer token {}: {}",
            path.display(),
            e
        ))),
    }
}

/// File contents, or `None` when the file does not exist
fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Config(format!("cannot read {}: {}", path.display(), e))),
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    parse_certs(&read_pem(path)?, path)
}

fn parse_certs(pem: &[u8], path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("invalid certificate in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!("no certificate in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = Zeroizing::new(read_pem(path)?);
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::Config(format!("invalid private key in {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Config(format!("no private key in {}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::Config(format!("invalid CA in {}: {}", path.display(), e)))?;
    }
    Ok(roots)
}
