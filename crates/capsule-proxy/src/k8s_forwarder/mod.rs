//! Control-plane request forwarding
//!
//! Sends a (possibly rewritten) request to the upstream API server and streams
//! the response back as it arrives, so watches are relayed live. Method, path
//! and body are never altered; only the `labelSelector` query parameter and
//! the credential headers are.
//!
//! Upgrade requests (`exec`, `attach`, `port-forward` over SPDY or WebSocket)
//! keep their `Connection`/`Upgrade` headers. Once the API server switches
//! protocols, both upgraded connections are spliced together until either
//! side closes.
//!
//! # Security
//!
//! Whenever the proxy substitutes its own credential, caller-supplied
//! impersonation headers are stripped first so a caller cannot borrow the
//! proxy's privileges under another identity.
//!
//! # Dependency Injection
//!
//! `UpstreamClient` is the seam to the API server so tests can inspect the
//! outgoing request without real infrastructure.

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, Request, Response, StatusCode};
use futures::TryStreamExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::auth::UserIdentity;
use crate::error::{Error, Result};

/// Maximum request body size (10 MB - reasonable for K8s API)
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Path to the in-cluster CA certificate
pub const CA_CERT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Path to the in-cluster ServiceAccount token
pub const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Query parameter carrying the label selector
pub const LABEL_SELECTOR_PARAM: &str = "labelSelector";

const IMPERSONATE_USER: &str = "Impersonate-User";
const IMPERSONATE_GROUP: &str = "Impersonate-Group";

/// Impersonation header names that must be stripped from incoming requests
const IMPERSONATION_HEADERS: &[&str] = &[
    IMPERSONATE_USER,
    IMPERSONATE_GROUP,
    "Impersonate-Uid",
    // Impersonate-Extra-* headers are handled with a prefix check
];

/// Headers scoped to a single connection, never forwarded
const HOP_BY_HOP_HEADERS: &[HeaderName] = &[
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Request as sent to the upstream API server
#[derive(Debug)]
pub struct UpstreamRequest {
    /// HTTP method
    pub method: Method,
    /// Path and query, starting with `/`
    pub path_and_query: String,
    /// Headers, hop-by-hop headers already removed
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

/// Byte stream of an upgraded connection
pub trait UpgradedIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpgradedIo for T {}

/// Upstream answer to an upgrade request
pub struct UpstreamUpgrade {
    /// Response relayed to the caller; `101 Switching Protocols` on success
    pub response: Response<Body>,
    /// Upgraded upstream connection, present only after a protocol switch
    pub io: Option<Box<dyn UpgradedIo>>,
}

/// Sends requests to the upstream API server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send the request and stream back the response
    async fn send(&self, request: UpstreamRequest) -> Result<Response<Body>>;

    /// Send an upgrade request over HTTP/1.1 and hand back the switched
    /// connection when the API server accepts it
    async fn upgrade(&self, request: UpstreamRequest) -> Result<UpstreamUpgrade>;
}

/// `UpstreamClient` over a shared reqwest connection pool
pub struct ReqwestUpstream {
    client: reqwest::Client,
    upgrade_client: reqwest::Client,
    base_url: String,
}

impl ReqwestUpstream {
    /// Client for `base_url`, trusting `ca_pem` in addition to the system roots
    pub fn new(base_url: &str, ca_pem: Option<&[u8]>) -> Result<Self> {
        let roots = match ca_pem {
            Some(pem) => {
                let certs = reqwest::Certificate::from_pem_bundle(pem)
                    .map_err(|e| Error::Config(format!("invalid upstream CA bundle: {}", e)))?;
                if certs.is_empty() {
                    return Err(Error::Config("upstream CA bundle holds no certificate".into()));
                }
                certs
            }
            None => Vec::new(),
        };

        Ok(Self {
            client: build_client(&roots, false)?,
            upgrade_client: build_client(&roots, true)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn execute(&self, client: &reqwest::Client, request: UpstreamRequest) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, request.path_and_query);
        client
            .request(request.method, url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| Error::Proxy(format!("cannot reach the API server: {}", e)))
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<Response<Body>> {
        let response = self.execute(&self.client, request).await?;
        Ok(streamed(response))
    }

    async fn upgrade(&self, request: UpstreamRequest) -> Result<UpstreamUpgrade> {
        let response = self.execute(&self.upgrade_client, request).await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!(status = %response.status(), "API server declined the upgrade");
            return Ok(UpstreamUpgrade {
                response: streamed(response),
                io: None,
            });
        }

        let mut switched = Response::new(Body::empty());
        *switched.status_mut() = response.status();
        *switched.headers_mut() = response.headers().clone();

        let io = response
            .upgrade()
            .await
            .map_err(|e| Error::Proxy(format!("API server upgrade failed: {}", e)))?;

        Ok(UpstreamUpgrade {
            response: switched,
            io: Some(Box::new(io)),
        })
    }
}

fn build_client(roots: &[reqwest::Certificate], http1_only: bool) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::none());
    for cert in roots {
        builder = builder.add_root_certificate(cert.clone());
    }
    if http1_only {
        builder = builder.http1_only();
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("cannot create upstream HTTP client: {}", e)))
}

/// Relay an upstream response body chunk by chunk
fn streamed(response: reqwest::Response) -> Response<Body> {
    let status = response.status();
    let mut headers = response.headers().clone();
    remove_hop_by_hop(&mut headers);

    debug!(status = %status, "Streaming upstream response");

    let stream = response.bytes_stream().map_err(std::io::Error::other);
    let mut out = Response::new(Body::from_stream(stream));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

/// Forward `request` unchanged apart from what the caller already rewrote
pub async fn forward(upstream: &dyn UpstreamClient, mut request: Request<Body>) -> Result<Response<Body>> {
    let upgrade = upgrade_protocol(request.headers());
    let on_upgrade = upgrade.is_some().then(|| hyper::upgrade::on(&mut request));

    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = parts.headers;
    remove_hop_by_hop(&mut headers);

    let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|e| Error::Internal(format!("Failed to read request body: {}", e)))?;

    debug!(method = %parts.method, path = %parts.uri.path(), "Forwarding to API server");

    let mut outgoing = UpstreamRequest {
        method: parts.method,
        path_and_query,
        headers,
        body,
    };

    let (Some(protocol), Some(on_upgrade)) = (upgrade, on_upgrade) else {
        return upstream.send(outgoing).await;
    };

    outgoing
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    outgoing.headers.insert(header::UPGRADE, protocol);

    let UpstreamUpgrade { response, io } = upstream.upgrade(outgoing).await?;
    if let Some(io) = io {
        tokio::spawn(splice(on_upgrade, io));
    }
    Ok(response)
}

/// The requested protocol when `headers` ask for a connection upgrade
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    wants_upgrade
        .then(|| headers.get(header::UPGRADE).cloned())
        .flatten()
}

/// Copy bytes both ways between the caller and the API server
async fn splice(caller: OnUpgrade, mut upstream: Box<dyn UpgradedIo>) {
    let upgraded = match caller.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!(error = %e, "Caller connection was not upgraded");
            return;
        }
    };

    let mut caller = TokioIo::new(upgraded);
    match tokio::io::copy_bidirectional(&mut caller, &mut upstream).await {
        Ok((sent, received)) => debug!(sent, received, "Upgraded connection closed"),
        Err(e) => debug!(error = %e, "Upgraded connection closed with error"),
    }
}

/// The caller's `labelSelector`, if any
pub fn label_selector(query: Option<&str>) -> Option<String> {
    form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == LABEL_SELECTOR_PARAM)
        .map(|(_, v)| v.into_owned())
}

/// Replace the `labelSelector` of `query`, keeping every other parameter
pub fn with_label_selector(query: Option<&str>, selector: &str) -> String {
    let mut out = form_urlencoded::Serializer::new(String::new());
    for (k, v) in form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        if k != LABEL_SELECTOR_PARAM {
            out.append_pair(&k, &v);
        }
    }
    out.append_pair(LABEL_SELECTOR_PARAM, selector);
    out.finish()
}

/// Rewrite the request URI with a new `labelSelector`
pub fn set_label_selector(request: &mut Request<Body>, selector: &str) -> Result<()> {
    let uri = request.uri();
    let query = with_label_selector(uri.query(), selector);
    let rewritten = format!("{}?{}", uri.path(), query)
        .parse()
        .map_err(|e| Error::Internal(format!("cannot rewrite request URI: {}", e)))?;
    *request.uri_mut() = rewritten;
    Ok(())
}

/// Replace the caller's credential with the proxy's own token
pub fn set_bearer(headers: &mut HeaderMap, token: &str) -> Result<()> {
    let credential = zeroize::Zeroizing::new(format!("Bearer {}", token));
    let mut value = HeaderValue::from_str(&credential)
        .map_err(|_| Error::Config("proxy bearer token is not a valid header value".into()))?;
    value.set_sensitive(true);
    headers.insert(header::AUTHORIZATION, value);
    Ok(())
}

/// Act as `identity` towards the API server, with the proxy's token when one
/// is configured
///
/// Groups go out as one `Impersonate-Group` header each, the list form the
/// API server parses for a comma-joined group set.
pub fn impersonate(headers: &mut HeaderMap, identity: &UserIdentity, token: Option<&str>) -> Result<()> {
    strip_impersonation_headers(headers);
    if let Some(token) = token {
        set_bearer(headers, token)?;
    }

    headers.insert(IMPERSONATE_USER, header_value(&identity.username)?);
    for group in &identity.groups {
        headers.append(IMPERSONATE_GROUP, header_value(group)?);
    }
    Ok(())
}

fn header_value(v: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(v)
        .map_err(|_| Error::Unauthorized(format!("identity {:?} is not a valid header value", v)))
}

/// Strip any user-supplied impersonation headers to prevent privilege escalation
pub fn strip_impersonation_headers(headers: &mut HeaderMap) {
    for header in IMPERSONATION_HEADERS {
        headers.remove(*header);
    }

    // Remove Impersonate-Extra-* headers (prefix-based)
    let extra_headers: Vec<_> = headers
        .keys()
        .filter(|k| k.as_str().starts_with("impersonate-extra-"))
        .cloned()
        .collect();

    for key in extra_headers {
        headers.remove(&key);
    }
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}
