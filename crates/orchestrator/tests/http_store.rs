//! Consumer read path against a mock object store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use radcert::deploy::{DeploymentApplier, InstallLayout};
use radcert::distribution::{DistributionAgent, SyncOutcome};
use radcert::state::MemoryStateStore;
use radcert::store::{ArtifactSource, HttpArtifactSource, StoreError};
use radcert_common::{ArtifactKind, CertificateArtifactSet, Classify, ErrorClass, RetryPolicy};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{domain, RecordingReload, TestCa, DOMAIN};

const LAST_MODIFIED: &str = "Sun, 06 Nov 1994 08:49:37 GMT";

fn object_path(kind: ArtifactKind) -> String {
    format!("/certs/{}/{}", DOMAIN, kind.file_name())
}

fn source(server: &MockServer) -> HttpArtifactSource {
    HttpArtifactSource::new(
        &server.uri(),
        format!("certs/{}", DOMAIN),
        Duration::from_secs(5),
    )
    .unwrap()
}

async fn mount_heads(server: &MockServer, etag_suffix: &str, expect: u64) {
    for kind in ArtifactKind::ALL {
        Mock::given(method("HEAD"))
            .and(path(object_path(kind)))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", format!("\"{}-{}\"", kind.file_name(), etag_suffix))
                    .insert_header("Last-Modified", LAST_MODIFIED),
            )
            .expect(expect)
            .mount(server)
            .await;
    }
}

async fn mount_gets(server: &MockServer, set: &CertificateArtifactSet, expect: u64) {
    for kind in ArtifactKind::ALL {
        Mock::given(method("GET"))
            .and(path(object_path(kind)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(set.body(kind).to_vec()))
            .expect(expect)
            .mount(server)
            .await;
    }
}

struct Host {
    dir: TempDir,
    reload: Arc<RecordingReload>,
    state: Arc<MemoryStateStore>,
    agent: DistributionAgent,
}

fn host(server: &MockServer) -> Host {
    let dir = TempDir::new().unwrap();
    let reload = Arc::new(RecordingReload::default());
    let state = Arc::new(MemoryStateStore::new());
    let applier = DeploymentApplier::new(InstallLayout::in_dir(dir.path()), reload.clone());
    let agent = DistributionAgent::new(
        Arc::new(source(server)),
        Arc::new(applier),
        state.clone(),
        domain(),
        RetryPolicy::fixed(3, Duration::ZERO),
    );
    Host {
        dir,
        reload,
        state,
        agent,
    }
}

#[tokio::test]
async fn test_head_reads_etag_and_last_modified() {
    let server = MockServer::start().await;
    mount_heads(&server, "v1", 1).await;

    let meta = source(&server)
        .head_metadata(ArtifactKind::PrivateKey)
        .await
        .unwrap();
    assert_eq!(meta.fingerprint, "\"server.key-v1\"");
    assert_eq!(
        meta.last_modified,
        Some(Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap())
    );
}

#[tokio::test]
async fn test_unchanged_store_is_not_downloaded_twice() {
    let server = MockServer::start().await;
    let ca = TestCa::new();
    let set = ca.leaf_set(DOMAIN, 60);
    mount_heads(&server, "v1", 2).await;
    mount_gets(&server, &set, 1).await;

    let host = host(&server);
    assert!(matches!(
        host.agent.sync(false).await.unwrap(),
        SyncOutcome::Applied { .. }
    ));
    assert_eq!(host.agent.sync(false).await.unwrap(), SyncOutcome::Unchanged);
    assert_eq!(host.reload.calls(), 1);
    assert_eq!(host.state.save_count(), 1);

    let installed = std::fs::read(host.dir.path().join("server.pem")).unwrap();
    assert_eq!(installed, set.leaf_chain.to_vec());
}

#[tokio::test]
async fn test_changed_etag_refetches_every_artifact() {
    let server = MockServer::start().await;
    let ca = TestCa::new();
    let set = ca.leaf_set(DOMAIN, 60);
    mount_heads(&server, "v1", 1).await;
    mount_gets(&server, &set, 1).await;

    let host = host(&server);
    host.agent.sync(false).await.unwrap();

    server.reset().await;
    mount_heads(&server, "v2", 1).await;
    mount_gets(&server, &set, 1).await;

    assert!(matches!(
        host.agent.sync(false).await.unwrap(),
        SyncOutcome::Applied { .. }
    ));
    assert_eq!(host.reload.calls(), 2);
}

#[tokio::test]
async fn test_forbidden_is_an_authorization_failure() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let host = host(&server);
    let err = host.agent.sync(false).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Authorization);
    assert_eq!(err.reason(), "store_access_denied");
    assert_eq!(host.state.save_count(), 0);
}

#[tokio::test]
async fn test_missing_object_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = source(&server)
        .head_metadata(ArtifactKind::LeafChain)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::NotFound {
            kind: ArtifactKind::LeafChain
        }
    ));
    assert!(err.class().is_retryable());
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let server = MockServer::start().await;
    let ca = TestCa::new();
    let set = ca.leaf_set(DOMAIN, 60);
    Mock::given(method("HEAD"))
        .and(path(object_path(ArtifactKind::LeafChain)))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_heads(&server, "v1", 1).await;
    mount_gets(&server, &set, 1).await;

    let host = host(&server);
    assert!(matches!(
        host.agent.sync(false).await.unwrap(),
        SyncOutcome::Applied { .. }
    ));
}

#[tokio::test]
async fn test_response_without_etag_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let err = source(&server)
        .head_metadata(ArtifactKind::TrustAnchor)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::MissingMetadata { .. }));
    assert_eq!(err.class(), ErrorClass::Validation);
}

#[tokio::test]
async fn test_unreachable_store_is_transient() {
    let source = HttpArtifactSource::new(
        "http://127.0.0.1:1",
        format!("certs/{}", DOMAIN),
        Duration::from_secs(1),
    )
    .unwrap();

    let err = source.get(ArtifactKind::LeafChain).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::TransientNetwork);
}
