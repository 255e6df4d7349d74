//! Integration tests for the tenant mutation protocol
//!
//! Drives the reconciler against a file-backed store. The first group fakes the
//! exporter with wiremock; the last test runs the real exporter on the same
//! document so a forced reload actually converges.

use sre_exporter::config::ExporterSettings;
use sre_exporter::document::{ConfigDocument, ConfigHash, TenantScope, digest};
use sre_exporter::exporter::Exporter;
use sre_exporter::pipeline::ControlSignal;
use sre_exporter::reconciler::{
    EXPECTED_HASH_ANNOTATION, ExporterClient, FileStore, MutationOutcome, OBSERVED_HASH_ANNOTATION,
    ReconcileError, Reconciler, RpcCode, SoftReason, TenantOp,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DOCUMENT: &str = r#"{"namespace":"orch_edgenode","source":{"queryURI":"http://127.0.0.1:9","mimirOrg":"tenant1|tenant2"},"collectors":[]}"#;

struct Fixture {
    dir: TempDir,
    document_path: PathBuf,
    identity_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let document_path = dir.path().join("orch_edgenode.json");
        let identity_path = dir.path().join("identity.json");
        std::fs::write(&document_path, DOCUMENT).unwrap();
        Self {
            dir,
            document_path,
            identity_path,
        }
    }

    fn reconciler(&self, exporter_url: &str) -> Reconciler {
        let store = FileStore::new(&self.document_path, &self.identity_path);
        let client = ExporterClient::new(
            format!("{exporter_url}/confighash"),
            format!("{exporter_url}/reload"),
        )
        .unwrap();
        Reconciler::new(Arc::new(store), client, Duration::from_secs(5))
    }

    fn stored(&self) -> ConfigDocument {
        let contents = std::fs::read_to_string(&self.document_path).unwrap();
        ConfigDocument::from_json("stored", &contents).unwrap()
    }

    fn identity(&self) -> serde_json::Value {
        let contents = std::fs::read_to_string(&self.identity_path).unwrap();
        serde_json::from_str(&contents).unwrap()
    }
}

fn hash_with_scope(scope: &str) -> ConfigHash {
    let mut document = ConfigDocument::from_json("fixture", DOCUMENT).unwrap();
    document.source.tenant_scope = TenantScope::new(scope);
    digest(&document).unwrap()
}

async fn exporter_reporting(hash: &ConfigHash, expected_reloads: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/confighash"))
        .respond_with(ResponseTemplate::new(200).set_body_string(hash.as_str()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reload"))
        .respond_with(ResponseTemplate::new(200))
        .expect(expected_reloads)
        .mount(&server)
        .await;
    server
}

// ─────────────────────────────────────────────────────────────────────────────
// Converged exporter
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_add_then_remove_persists_each_scope() {
    let fixture = Fixture::new();

    let exporter = exporter_reporting(&hash_with_scope("tenant1|tenant2|tenant3"), 0).await;
    let outcome = fixture
        .reconciler(&exporter.uri())
        .mutate("tenant3", TenantOp::Add)
        .await
        .unwrap();
    assert_eq!(outcome, MutationOutcome::Applied);
    assert_eq!(
        fixture.stored().source.tenant_scope.tenants(),
        vec!["tenant1", "tenant2", "tenant3"]
    );

    let exporter = exporter_reporting(&hash_with_scope("tenant1|tenant3"), 0).await;
    let outcome = fixture
        .reconciler(&exporter.uri())
        .mutate("tenant2", TenantOp::Remove)
        .await
        .unwrap();
    assert_eq!(outcome, MutationOutcome::Applied);
    assert_eq!(fixture.stored().source.tenant_scope.as_str(), "tenant1|tenant3");
    assert!(!fixture.identity_path.exists());
}

#[tokio::test]
async fn test_soft_outcomes_leave_the_document_byte_for_byte() {
    let fixture = Fixture::new();
    let exporter = exporter_reporting(&hash_with_scope("tenant1|tenant2"), 0).await;
    let reconciler = fixture.reconciler(&exporter.uri());

    let outcome = reconciler.mutate("tenant1", TenantOp::Add).await.unwrap();
    assert_eq!(
        outcome,
        MutationOutcome::AlreadyInDesiredState(SoftReason::AlreadyExists)
    );
    assert_eq!(outcome.code(), "AlreadyExists");

    let outcome = reconciler.mutate("tenant7", TenantOp::Remove).await.unwrap();
    assert_eq!(
        outcome,
        MutationOutcome::AlreadyInDesiredState(SoftReason::NotFound)
    );
    assert_eq!(outcome.code(), "NotFound");

    assert_eq!(
        std::fs::read_to_string(&fixture.document_path).unwrap(),
        DOCUMENT
    );
}

#[tokio::test]
async fn test_invalid_tenant_touches_nothing() {
    let fixture = Fixture::new();
    let exporter = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&exporter)
        .await;

    let too_long = "a".repeat(151);
    for tenant in ["", "tenant@1", "tenant 1", "..", too_long.as_str()] {
        let err = fixture
            .reconciler(&exporter.uri())
            .mutate(tenant, TenantOp::Add)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidTenant(_)), "{tenant:?}");
        assert_eq!(err.code(), RpcCode::InvalidArgument);
    }

    assert_eq!(
        std::fs::read_to_string(&fixture.document_path).unwrap(),
        DOCUMENT
    );
}

#[tokio::test]
async fn test_applied_mutation_keeps_collector_definitions() {
    let fixture = Fixture::new();
    let original = serde_json::json!({
        "namespace": "orch_edgenode",
        "source": {"queryURI": "http://127.0.0.1:9", "mimirOrg": "tenant1"},
        "collectors": [{"name": "node", "enabled": true, "metrics": [{
            "name": "cpu", "enabled": true, "query": "up", "id": "cpu", "help": "CPU",
            "labels": ["instance"], "destLabels": ["node"], "Type": "Gauge"
        }]}]
    });
    std::fs::write(&fixture.document_path, original.to_string()).unwrap();

    let mut expected = ConfigDocument::from_json("fixture", &original.to_string()).unwrap();
    expected.source.tenant_scope = TenantScope::new("tenant1|tenant2");
    let exporter = exporter_reporting(&digest(&expected).unwrap(), 0).await;

    let outcome = fixture
        .reconciler(&exporter.uri())
        .mutate("tenant2", TenantOp::Add)
        .await
        .unwrap();
    assert_eq!(outcome, MutationOutcome::Applied);

    let persisted: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&fixture.document_path).unwrap()).unwrap();
    let mut want = original.clone();
    want["source"]["mimirOrg"] = serde_json::json!("tenant1|tenant2");
    assert_eq!(persisted, want);
    assert_eq!(persisted["collectors"][0]["metrics"][0]["enabled"], true);
}

// ─────────────────────────────────────────────────────────────────────────────
// Diverged exporter
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mismatch_annotates_reloads_and_reports_unavailable() {
    let fixture = Fixture::new();
    let stale = hash_with_scope("tenant1|tenant2");
    let exporter = exporter_reporting(&stale, 1).await;

    let err = fixture
        .reconciler(&exporter.uri())
        .mutate("tenant2", TenantOp::Remove)
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::ConvergencePending { .. }));
    assert_eq!(err.code(), RpcCode::Unavailable);

    // The mutation itself is kept; only convergence is pending
    assert_eq!(fixture.stored().source.tenant_scope.as_str(), "tenant1");

    let identity = fixture.identity();
    let annotations = &identity["annotations"];
    assert_eq!(
        annotations[EXPECTED_HASH_ANNOTATION],
        hash_with_scope("tenant1").as_str()
    );
    assert_eq!(annotations[OBSERVED_HASH_ANNOTATION], stale.as_str());
}

#[tokio::test]
async fn test_retry_after_mismatch_reports_soft_outcome() {
    let fixture = Fixture::new();

    let exporter = exporter_reporting(&hash_with_scope("tenant1|tenant2"), 1).await;
    fixture
        .reconciler(&exporter.uri())
        .mutate("tenant3", TenantOp::Add)
        .await
        .unwrap_err();

    let exporter = exporter_reporting(&hash_with_scope("tenant1|tenant2|tenant3"), 0).await;
    let outcome = fixture
        .reconciler(&exporter.uri())
        .mutate("tenant3", TenantOp::Add)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        MutationOutcome::AlreadyInDesiredState(SoftReason::AlreadyExists)
    );
}

#[tokio::test]
async fn test_unreachable_exporter_is_unavailable() {
    let fixture = Fixture::new();

    let err = fixture
        .reconciler("http://127.0.0.1:9")
        .mutate("tenant3", TenantOp::Add)
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::HashUnavailable(_)));
    assert_eq!(err.code(), RpcCode::Unavailable);
    assert_eq!(
        fixture.stored().source.tenant_scope.as_str(),
        "tenant1|tenant2|tenant3"
    );
}

#[tokio::test]
async fn test_missing_document_is_internal() {
    let fixture = Fixture::new();
    std::fs::remove_file(&fixture.document_path).unwrap();
    let exporter = exporter_reporting(&hash_with_scope(""), 0).await;

    let err = fixture
        .reconciler(&exporter.uri())
        .mutate("tenant3", TenantOp::Add)
        .await
        .unwrap_err();
    assert_eq!(err.code(), RpcCode::Internal);
    assert!(fixture.dir.path().read_dir().unwrap().next().is_none());
}

// ─────────────────────────────────────────────────────────────────────────────
// Against the real exporter
// ─────────────────────────────────────────────────────────────────────────────

fn exporter_settings(document: &Path) -> ExporterSettings {
    ExporterSettings::from_str(&format!(
        r#"
[server]
listen_address = "127.0.0.1:0"

[exporter]
customer_label = "acme"
config_files = [{:?}]
config_hash_namespace = "orch_edgenode"

[self_monitoring]
enabled = false
"#,
        document.display().to_string()
    ))
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_reload_converges_the_real_exporter() {
    let fixture = Fixture::new();
    let (exporter, receiver) = Exporter::new(exporter_settings(&fixture.document_path));
    let exporter = Arc::new(exporter);
    let serving = tokio::spawn({
        let exporter = exporter.clone();
        async move { exporter.serve(receiver).await }
    });

    let mut address = None;
    for _ in 0..200 {
        address = exporter.manager().local_addr();
        if address.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let base_url = format!("http://{}", address.expect("Exporter should be listening"));
    let reconciler = fixture.reconciler(&base_url);

    // The exporter still serves the old scope, so the first attempt forces a reload
    let err = reconciler
        .mutate("tenant3", TenantOp::Add)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::ConvergencePending { .. }));

    let mut converged = None;
    for _ in 0..200 {
        match reconciler.mutate("tenant3", TenantOp::Add).await {
            Ok(outcome) => {
                converged = Some(outcome);
                break;
            }
            Err(e) => assert_eq!(e.code(), RpcCode::Unavailable),
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        converged,
        Some(MutationOutcome::AlreadyInDesiredState(
            SoftReason::AlreadyExists
        ))
    );

    exporter.signals().send(ControlSignal::Terminate).unwrap();
    serving.await.unwrap().unwrap();
}
