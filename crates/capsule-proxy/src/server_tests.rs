use super::*;
use axum::body::Body;
use axum::http::StatusCode;
use capsule_common::annotations;
use capsule_common::crd::{AllowedListSpec, OwnerKind, Tenant};
use kube::ResourceExt;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use zeroize::Zeroizing;

use crate::auth::UserIdentity;
use crate::backend::{MockControlPlane, ObjectRef, ScopedKind};
use crate::cert_auth::tests::client_cert;
use crate::cert_auth::{CertValidator, UsernameClaim};
use crate::k8s_forwarder::{label_selector, MockUpstreamClient, UpstreamRequest, UpstreamUpgrade};
use crate::tenant_index::tests::tenant;
use crate::token_review::MockTokenReviewer;

const PRIVILEGED_GROUP: &str = "capsule.clastix.io";

fn settings() -> ProxySettings {
    ProxySettings {
        privileged_group: PRIVILEGED_GROUP.to_string(),
        bearer_token: Some(Zeroizing::new("proxy-token".to_string())),
        certs: CertValidator::new(UsernameClaim::CommonName),
        listening_tls: true,
    }
}

fn router(reviewer: MockTokenReviewer, cluster: MockControlPlane, upstream: MockUpstreamClient) -> Router {
    build_router(AppState {
        reviewer: Arc::new(reviewer),
        cluster: Arc::new(cluster),
        upstream: Arc::new(upstream),
        settings: Arc::new(settings()),
    })
}

/// Reviewer accepting `alice-token` for alice in the privileged group
fn alice_reviewer() -> MockTokenReviewer {
    let mut reviewer = MockTokenReviewer::new();
    reviewer
        .expect_review()
        .withf(|token| token == "alice-token")
        .returning(|_| {
            Ok(UserIdentity {
                username: "alice".to_string(),
                groups: vec![PRIVILEGED_GROUP.to_string()],
            })
        });
    reviewer
}

/// Cluster where alice owns `owned` directly
fn cluster_owning(owned: Vec<Tenant>) -> MockControlPlane {
    let mut cluster = MockControlPlane::new();
    cluster
        .expect_tenants_for_owner()
        .returning(move |kind, name| match (kind, name) {
            (OwnerKind::User, "alice") => Ok(owned.clone()),
            _ => Ok(vec![]),
        });
    cluster
}

fn ok_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from("{}"))
        .unwrap()
}

fn forwarded_selector(request: &UpstreamRequest) -> Option<String> {
    let query = request.path_and_query.split_once('?').map(|(_, q)| q);
    label_selector(query)
}

fn alice_get(uri: &str) -> Request {
    axum::http::Request::builder()
        .method("GET")
        .uri(uri)
        .header("Authorization", "Bearer alice-token")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_healthz() {
    let app = router(
        MockTokenReviewer::new(),
        MockControlPlane::new(),
        MockUpstreamClient::new(),
    );

    let response = app
        .oneshot(axum::http::Request::builder().uri("/_healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_namespace_list_is_scoped_to_owned_tenants() {
    let mut upstream = MockUpstreamClient::new();
    upstream
        .expect_send()
        .withf(|req| {
            req.path_and_query.starts_with("/api/v1/namespaces?")
                && forwarded_selector(req).as_deref() == Some("capsule.clastix.io/tenant in (t1)")
                && req.headers.get("Authorization").unwrap() == "Bearer proxy-token"
        })
        .times(1)
        .returning(|_| Ok(ok_response()));

    let app = router(
        alice_reviewer(),
        cluster_owning(vec![tenant("t1", OwnerKind::User, "alice")]),
        upstream,
    );

    let response = app.oneshot(alice_get("/api/v1/namespaces")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_namespace_list_without_tenants_matches_nothing() {
    let mut upstream = MockUpstreamClient::new();
    upstream
        .expect_send()
        .withf(|req| forwarded_selector(req).as_deref() == Some("dontexistsignoreme"))
        .times(1)
        .returning(|_| Ok(ok_response()));

    let app = router(alice_reviewer(), cluster_owning(vec![]), upstream);

    let response = app.oneshot(alice_get("/api/v1/namespaces")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_caller_selector_is_conjoined() {
    let mut upstream = MockUpstreamClient::new();
    upstream
        .expect_send()
        .withf(|req| {
            forwarded_selector(req).as_deref() == Some("env=prod,capsule.clastix.io/tenant in (t1)")
        })
        .times(1)
        .returning(|_| Ok(ok_response()));

    let app = router(
        alice_reviewer(),
        cluster_owning(vec![tenant("t1", OwnerKind::User, "alice")]),
        upstream,
    );

    let response = app
        .oneshot(alice_get("/api/v1/namespaces?labelSelector=env%3Dprod"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_selector_naming_foreign_tenant_is_forbidden() {
    let mut upstream = MockUpstreamClient::new();
    upstream.expect_send().never();

    let app = router(
        alice_reviewer(),
        cluster_owning(vec![tenant("t1", OwnerKind::User, "alice")]),
        upstream,
    );

    let response = app
        .oneshot(alice_get(
            "/api/v1/namespaces?labelSelector=capsule.clastix.io%2Ftenant%20in%20(t2)",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_rejected_token_is_unauthorized() {
    let mut reviewer = MockTokenReviewer::new();
    reviewer
        .expect_review()
        .returning(|_| Err(Error::Unauthorized("token expired".into())));
    let mut upstream = MockUpstreamClient::new();
    upstream.expect_send().never();

    let app = router(reviewer, MockControlPlane::new(), upstream);

    let response = app.oneshot(alice_get("/api/v1/namespaces")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unmatched_path_passes_through_untouched() {
    let mut upstream = MockUpstreamClient::new();
    upstream
        .expect_send()
        .withf(|req| {
            req.path_and_query == "/api/v1/namespaces/t1-dev/pods?limit=10"
                && req.headers.get("Authorization").unwrap() == "Bearer caller-token"
                && req.headers.get("Impersonate-User").is_none()
        })
        .times(1)
        .returning(|_| Ok(ok_response()));

    let app = router(MockTokenReviewer::new(), MockControlPlane::new(), upstream);

    let request = axum::http::Request::builder()
        .uri("/api/v1/namespaces/t1-dev/pods?limit=10")
        .header("Authorization", "Bearer caller-token")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_undeclared_method_on_module_path_passes_through() {
    let mut upstream = MockUpstreamClient::new();
    upstream
        .expect_send()
        .withf(|req| req.method == Method::POST && forwarded_selector(req).is_none())
        .times(1)
        .returning(|_| Ok(ok_response()));

    let app = router(MockTokenReviewer::new(), MockControlPlane::new(), upstream);

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/namespaces")
        .header("Authorization", "Bearer alice-token")
        .body(Body::from(r#"{"metadata":{"name":"t1-dev"}}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_non_privileged_certificate_caller_is_impersonated() {
    let mut upstream = MockUpstreamClient::new();
    upstream
        .expect_send()
        .withf(|req| {
            let groups: Vec<_> = req.headers.get_all("Impersonate-Group").iter().collect();
            req.headers.get("Authorization").unwrap() == "Bearer proxy-token"
                && req.headers.get("Impersonate-User").unwrap() == "bob"
                && groups == vec!["devs"]
                && forwarded_selector(req).is_none()
        })
        .times(1)
        .returning(|_| Ok(ok_response()));

    let app = router(MockTokenReviewer::new(), MockControlPlane::new(), upstream);

    let mut request = axum::http::Request::builder()
        .uri("/api/v1/namespaces")
        .header("Impersonate-User", "system:admin")
        .body(Body::empty())
        .unwrap();
    request
        .extensions_mut()
        .insert(ClientCertChain::new(vec![client_cert("bob", &["devs"], None)]));

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_privileged_certificate_caller_is_scoped() {
    let mut upstream = MockUpstreamClient::new();
    upstream
        .expect_send()
        .withf(|req| {
            forwarded_selector(req).as_deref() == Some("capsule.clastix.io/tenant in (t1)")
                && req.headers.get("Impersonate-User").is_none()
        })
        .times(1)
        .returning(|_| Ok(ok_response()));

    let app = router(
        MockTokenReviewer::new(),
        cluster_owning(vec![tenant("t1", OwnerKind::User, "alice")]),
        upstream,
    );

    let mut request = axum::http::Request::builder().uri("/api/v1/namespaces").body(Body::empty()).unwrap();
    request
        .extensions_mut()
        .insert(ClientCertChain::new(vec![client_cert("alice", &[PRIVILEGED_GROUP], None)]));

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_storage_class_list_without_grant_matches_nothing() {
    let mut cluster = cluster_owning(vec![tenant("t1", OwnerKind::User, "alice")]);
    cluster
        .expect_list_objects()
        .returning(|_| Ok(vec![ObjectRef::named("fast")]));

    let mut upstream = MockUpstreamClient::new();
    upstream
        .expect_send()
        .withf(|req| forwarded_selector(req).as_deref() == Some("dontexistsignoreme"))
        .times(1)
        .returning(|_| Ok(ok_response()));

    let app = router(alice_reviewer(), cluster, upstream);

    let response = app
        .oneshot(alice_get("/apis/storage.k8s.io/v1/storageclasses"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_storage_class_list_is_scoped_to_allowed_classes() {
    let mut owned = tenant("t1", OwnerKind::User, "alice");
    owned.spec.storage_classes = Some(AllowedListSpec {
        exact: vec!["fast".to_string()],
        regex: None,
    });
    owned
        .annotations_mut()
        .insert(annotations::STORAGE_CLASS_LISTING.to_string(), "true".to_string());

    let mut cluster = cluster_owning(vec![owned]);
    cluster
        .expect_list_objects()
        .withf(|kind| *kind == ScopedKind::StorageClass)
        .returning(|_| Ok(vec![ObjectRef::named("fast"), ObjectRef::named("slow")]));

    let mut upstream = MockUpstreamClient::new();
    upstream
        .expect_send()
        .withf(|req| forwarded_selector(req).as_deref() == Some("name in (fast)"))
        .times(1)
        .returning(|_| Ok(ok_response()));

    let app = router(alice_reviewer(), cluster, upstream);

    let response = app
        .oneshot(alice_get("/apis/storage.k8s.io/v1/storageclasses"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_storage_class_item_outside_scope_is_not_found() {
    let mut cluster = cluster_owning(vec![tenant("t1", OwnerKind::User, "alice")]);
    cluster.expect_get_object().returning(|_, _| Ok(None));
    cluster.expect_list_objects().returning(|_| Ok(vec![]));

    let mut upstream = MockUpstreamClient::new();
    upstream.expect_send().never();

    let app = router(alice_reviewer(), cluster, upstream);

    let response = app
        .oneshot(alice_get("/apis/storage.k8s.io/v1/storageclasses/ghost"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[test]
fn test_method_filter_covers_declared_methods() {
    let filter = method_filter(&[Method::GET, Method::DELETE]);
    assert_eq!(filter, MethodFilter::GET.or(MethodFilter::DELETE));
    assert_eq!(method_filter(&[]), MethodFilter::GET);
}

#[tokio::test]
async fn test_non_privileged_token_caller_passes_through_untouched() {
    let mut reviewer = MockTokenReviewer::new();
    reviewer.expect_review().returning(|_| {
        Ok(UserIdentity {
            username: "bob".to_string(),
            groups: vec!["devs".to_string()],
        })
    });

    let mut upstream = MockUpstreamClient::new();
    upstream
        .expect_send()
        .withf(|req| {
            req.path_and_query == "/api/v1/namespaces"
                && forwarded_selector(req).is_none()
                && req.headers.get("Authorization").unwrap() == "Bearer bob-token"
                && req.headers.get("Impersonate-User").unwrap() == "carol"
        })
        .times(1)
        .returning(|_| Ok(ok_response()));

    let app = router(reviewer, MockControlPlane::new(), upstream);

    let request = axum::http::Request::builder()
        .uri("/api/v1/namespaces")
        .header("Authorization", "Bearer bob-token")
        .header("Impersonate-User", "carol")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_tenant_index_failure_is_service_unavailable() {
    let mut cluster = MockControlPlane::new();
    cluster
        .expect_tenants_for_owner()
        .returning(|_, _| Err(Error::BackendUnavailable("etcd timeout".into())));

    let mut upstream = MockUpstreamClient::new();
    upstream.expect_send().never();

    let app = router(alice_reviewer(), cluster, upstream);

    let response = app.oneshot(alice_get("/api/v1/namespaces")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["kind"], "Status");
    assert_eq!(status["reason"], "ServiceUnavailable");
    assert_eq!(status["code"], 503);
}

/// Read from `stream` until `needle` shows up
async fn read_until<S: AsyncRead + Unpin>(stream: &mut S, needle: &str) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !String::from_utf8_lossy(&buf).contains(needle) {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before {:?}", needle);
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8(buf).unwrap()
}

#[tokio::test]
async fn test_exec_upgrade_is_spliced_to_upstream() {
    let (proxy_side, mut api_side) = tokio::io::duplex(64);

    let mut upstream = MockUpstreamClient::new();
    upstream.expect_send().never();
    upstream
        .expect_upgrade()
        .withf(|req| {
            req.path_and_query == "/api/v1/namespaces/t1-dev/pods/web/exec?command=sh"
                && req.headers.get("Connection").unwrap() == "Upgrade"
                && req.headers.get("Upgrade").unwrap() == "SPDY/3.1"
                && req.headers.get("Authorization").unwrap() == "Bearer caller-token"
        })
        .times(1)
        .return_once(move |_| {
            Ok(UpstreamUpgrade {
                response: Response::builder()
                    .status(StatusCode::SWITCHING_PROTOCOLS)
                    .header("Connection", "Upgrade")
                    .header("Upgrade", "SPDY/3.1")
                    .body(Body::empty())
                    .unwrap(),
                io: Some(Box::new(proxy_side)),
            })
        });

    let app = router(MockTokenReviewer::new(), MockControlPlane::new(), upstream);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            b"POST /api/v1/namespaces/t1-dev/pods/web/exec?command=sh HTTP/1.1\r\n\
              Host: proxy.local\r\n\
              Authorization: Bearer caller-token\r\n\
              Connection: Upgrade\r\n\
              Upgrade: SPDY/3.1\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .await
        .unwrap();

    let head = read_until(&mut client, "\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected response: {}", head);

    let mut buf = [0u8; 4];
    client.write_all(b"ping").await.unwrap();
    api_side.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    api_side.write_all(b"pong").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn test_idle_peer_does_not_block_tls_handshakes() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    let material = TlsMaterial {
        cert_chain: vec![cert.der().clone()],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        client_roots: None,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(
        MockTokenReviewer::new(),
        MockControlPlane::new(),
        MockUpstreamClient::new(),
    );
    tokio::spawn(serve_tls(listener, app, material));

    // Connects and never sends a ClientHello
    let _idle = TcpStream::connect(addr).await.unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.der().clone()).unwrap();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ));

    let healthz = async {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let server_name = ServerName::try_from("localhost").unwrap();
        let mut tls = connector.connect(server_name, tcp).await.unwrap();
        tls.write_all(b"GET /_healthz HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        read_until(&mut tls, "ok").await
    };

    let response = tokio::time::timeout(Duration::from_secs(5), healthz)
        .await
        .expect("TLS listener stalled behind an idle connection");
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);
}
