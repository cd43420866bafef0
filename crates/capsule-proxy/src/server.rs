//! Proxy server
//!
//! Builds the router from the module registry and serves it over plain HTTP
//! or TLS. Under TLS the peer certificate chain of each connection is attached
//! to every request made on it.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, on, MethodFilter};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperAcceptor;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use kube::Client;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::backend::{ControlPlane, KubeControlPlane};
use crate::cert_auth::{optional_client_cert_verifier, ClientCertChain};
use crate::config::{ProxySettings, ServerConfig, TlsMaterial};
use crate::error::{Error, Result};
use crate::k8s_forwarder::{ReqwestUpstream, UpstreamClient};
use crate::middleware::{require_privileged_group, verify_token};
use crate::modules::registry;
use crate::proxy::{passthrough, scoped};
use crate::token_review::{KubeTokenReviewer, TokenReviewer};

/// How long in-flight TLS connections may take to drain on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a client may take to complete the TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Verifies bearer tokens
    pub reviewer: Arc<dyn TokenReviewer>,
    /// Reads tenants and cluster-scoped objects
    pub cluster: Arc<dyn ControlPlane>,
    /// Sends requests to the API server
    pub upstream: Arc<dyn UpstreamClient>,
    /// Immutable startup settings
    pub settings: Arc<ProxySettings>,
}

/// Router serving the health check, every module route and the pass-through
/// fallback
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new().route("/_healthz", get(|| async { "ok" }));

    for module in registry() {
        let handler = move |State(state): State<AppState>, request: Request| scoped(state, module, request);
        let route = on(method_filter(module.methods()), handler)
            .fallback(passthrough)
            .route_layer(from_fn_with_state(state.clone(), require_privileged_group))
            .route_layer(from_fn_with_state(state.clone(), verify_token));
        router = router.route(&module.path(), route);
    }

    router
        .fallback(passthrough)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

fn method_filter(methods: &[Method]) -> MethodFilter {
    methods
        .iter()
        .filter_map(|m| MethodFilter::try_from(m.clone()).ok())
        .reduce(MethodFilter::or)
        .unwrap_or(MethodFilter::GET)
}

fn panic_response(_: Box<dyn Any + Send + 'static>) -> Response {
    Error::Internal("request handler panicked".into()).into_response()
}

/// Start the proxy and serve until SIGINT or SIGTERM
pub async fn start_server(config: ServerConfig, client: Client) -> Result<()> {
    let ServerConfig {
        addr,
        upstream,
        upstream_ca,
        tls,
        settings,
    } = config;

    let state = AppState {
        reviewer: Arc::new(KubeTokenReviewer::new(client.clone())),
        cluster: Arc::new(KubeControlPlane::new(client)),
        upstream: Arc::new(ReqwestUpstream::new(&upstream, upstream_ca.as_deref())?),
        settings: Arc::new(settings),
    };
    let app = build_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("cannot bind {}: {}", addr, e)))?;

    match tls {
        Some(material) => {
            info!(addr = %addr, upstream = %upstream, "Starting capsule proxy (TLS)");
            serve_tls(listener, app, material).await
        }
        None => {
            info!(addr = %addr, upstream = %upstream, "Starting capsule proxy");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .map_err(|e| Error::Internal(format!("server error: {}", e)))
        }
    }
}

fn tls_acceptor(material: TlsMaterial) -> Result<TlsAcceptor> {
    let builder = rustls::ServerConfig::builder();
    let builder = match material.client_roots {
        Some(roots) => builder.with_client_cert_verifier(optional_client_cert_verifier(roots)?),
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(material.cert_chain, material.key)
        .map_err(|e| Error::Config(format!("TLS config error: {}", e)))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn serve_tls(listener: TcpListener, app: Router, material: TlsMaterial) -> Result<()> {
    let acceptor = tls_acceptor(material)?;
    let graceful = GracefulShutdown::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        let watcher = graceful.watcher();

        tokio::spawn(async move {
            let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(remote_addr = %remote_addr, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(remote_addr = %remote_addr, "TLS handshake timed out");
                    return;
                }
            };

            let chain = ClientCertChain::new(
                stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .map(<[_]>::to_vec)
                    .unwrap_or_default(),
            );
            let service = app.map_request(move |mut request: Request<hyper::body::Incoming>| {
                request.extensions_mut().insert(chain.clone());
                request
            });

            let conn = HyperAcceptor::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), TowerToHyperService::new(service))
                .into_owned();

            if let Err(e) = watcher.watch(conn).await {
                debug!(remote_addr = %remote_addr, error = %e, "Connection closed with error");
            }
        });
    }

    info!("Draining connections");
    tokio::select! {
        _ = graceful.shutdown() => info!("All connections drained"),
        _ = tokio::time::sleep(DRAIN_TIMEOUT) => warn!("Timed out draining connections"),
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
