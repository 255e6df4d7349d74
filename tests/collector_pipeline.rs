//! Integration tests for collection through the exporter's HTTP surface
//!
//! Serves a pipeline built from a configuration document against a fake query
//! API and a fake secret store, then scrapes it like a monitoring agent would.

use serde_json::json;
use sre_exporter::config::ExporterSettings;
use sre_exporter::exporter::Exporter;
use sre_exporter::pipeline::ControlSignal;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn vector(result: serde_json::Value) -> serde_json::Value {
    json!({"status": "success", "data": {"resultType": "vector", "result": result}})
}

async fn scrape(settings: ExporterSettings, route: &str) -> String {
    let (exporter, receiver) = Exporter::new(settings);
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
    let address = address.expect("Exporter should be listening");

    let response = reqwest::get(format!("http://{address}{route}"))
        .await
        .expect("Scrape should succeed");
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.unwrap();

    exporter.signals().send(ControlSignal::Terminate).unwrap();
    serving.await.unwrap().unwrap();
    body
}

fn settings(dir: &TempDir, document: &serde_json::Value, vault_uris: &[String]) -> ExporterSettings {
    let path = dir.path().join("orch.json");
    std::fs::write(&path, document.to_string()).unwrap();

    ExporterSettings::from_str(&format!(
        r#"
[server]
listen_address = "127.0.0.1:0"

[exporter]
customer_label = "acme"
config_files = [{:?}]
config_hash_namespace = "orch"

[vault]
uris = {}

[self_monitoring]
enabled = false
"#,
        path.display().to_string(),
        serde_json::to_string(vault_uris).unwrap()
    ))
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_query_only_marks_collector_down() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/query"))
        .and(query_param("query", "broken"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/query"))
        .and(query_param("query", "working"))
        .and(header("X-Scope-OrgID", "tenant1|tenant2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vector(json!([
            {"metric": {"instance": "a"}, "value": [1700000000.0, "1"]},
            {"metric": {"instance": "b"}, "value": [1700000000.0, "2"]},
            {"metric": {"instance": "c"}, "value": [1700000000.0, "3"]}
        ]))))
        .mount(&upstream)
        .await;

    let document = json!({
        "namespace": "orch",
        "source": {"queryURI": upstream.uri(), "mimirOrg": "tenant1|tenant2"},
        "collectors": [{"name": "node", "enabled": true, "metrics": [
            {"name": "a", "query": "broken", "id": "broken", "help": "a", "labels": [], "Type": "Gauge"},
            {"name": "b", "query": "working", "id": "working", "help": "b", "labels": ["instance"], "Type": "Gauge"}
        ]}]
    });
    let dir = TempDir::new().unwrap();

    let body = scrape(settings(&dir, &document, &[]), "/orch/metrics").await;

    assert!(body.contains(r#"orch_node_working{customer="acme",instance="c",service="orch"} 3"#), "{body}");
    assert!(body.contains(r#"orch_node_up{customer="acme",service="orch"} 0"#), "{body}");
    assert!(body.contains(r#"orch_node_query_samples{customer="acme",service="orch"} 3"#), "{body}");
    assert!(!body.contains("orch_node_broken"), "{body}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_destination_labels_rename_source_labels() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vector(json!([
            {"metric": {"code": "200", "exported_service": "api"}, "value": [1700000000.0, "42"]}
        ]))))
        .mount(&upstream)
        .await;

    let document = json!({
        "namespace": "orch",
        "source": {"queryURI": upstream.uri(), "mimirOrg": "tenant1"},
        "collectors": [
            {"name": "traefik", "enabled": true, "metrics": [{
                "name": "requests", "query": "traefik_service_requests_total", "id": "requests_total",
                "help": "Requests processed", "labels": ["code", "exported_service"],
                "destLabels": ["status", "target_service"], "Type": "Counter"
            }]},
            {"name": "disabled", "enabled": false, "metrics": []}
        ]
    });
    let dir = TempDir::new().unwrap();

    let body = scrape(settings(&dir, &document, &[]), "/orch/metrics").await;

    assert!(body.contains("# TYPE orch_traefik_requests_total counter"), "{body}");
    assert!(body.contains(r#"status="200""#), "{body}");
    assert!(body.contains(r#"target_service="api""#), "{body}");
    assert!(!body.contains("exported_service"), "{body}");
    assert!(!body.contains("orch_disabled_up"), "{body}");
    assert!(body.contains(r#"orch_traefik_up{customer="acme",service="orch"} 1"#), "{body}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_vault_pipeline_reports_instance_status() {
    let vault = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/health"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "initialized": true, "sealed": false, "standby": true
        })))
        .mount(&vault)
        .await;

    let dir = TempDir::new().unwrap();
    let document = json!({"namespace": "orch"});

    let body = scrape(settings(&dir, &document, &[vault.uri()]), "/vault/metrics").await;

    let instance = format!(r#"instance="{}""#, vault.uri());
    let status_line = body
        .lines()
        .find(|line| line.starts_with("orch_vault_monitor_vault_status{") && line.contains(&instance))
        .unwrap_or_else(|| panic!("missing status line in {body}"));
    assert!(status_line.ends_with(" 0"), "{status_line}");
    assert!(body.contains("orch_vault_status_up{"), "{body}");
}
