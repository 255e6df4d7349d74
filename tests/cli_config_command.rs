//! Integration tests for the `config` subcommand of both binaries
//!
//! Verifies that the generated templates are complete, load as valid settings
//! files and survive being written to disk.

use sre_exporter::cli::{exporter_config_template, reloader_config_template, write_template};
use sre_exporter::config::{ExporterSettings, ReloaderSettings, Settings};
use std::fs;
use tempfile::TempDir;

/// Helper to create temporary directory for file operations
fn create_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

// ─────────────────────────────────────────────────────────────────────────────
// Template Content Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_exporter_template_has_all_sections() {
    let template = exporter_config_template();

    for section in [
        "[server]",
        "[exporter]",
        "[vault]",
        "[self_monitoring]",
        "[observability]",
    ] {
        assert!(template.contains(section), "Missing {section}");
    }
}

#[test]
fn test_reloader_template_has_all_sections() {
    let template = reloader_config_template();

    for section in ["[server]", "[store]", "[exporter]", "[observability]"] {
        assert!(template.contains(section), "Missing {section}");
    }
}

#[test]
fn test_templates_include_documentation() {
    assert!(exporter_config_template().contains("Metrics Exporter Settings"));
    assert!(reloader_config_template().contains("Config Reloader Settings"));
    assert!(exporter_config_template().contains("/<namespace>/metrics"));
}

// ─────────────────────────────────────────────────────────────────────────────
// File Operation Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_exporter_template_roundtrip_preserves_settings() {
    let temp_dir = create_temp_dir();
    let path = temp_dir.path().join("exporter.toml");

    write_template(exporter_config_template(), path.to_str()).expect("Failed to write template");
    let settings = ExporterSettings::from_file(&path).expect("Template should load");

    assert_eq!(settings.server.listen_address.port(), 9141);
    assert_eq!(settings.server.shutdown_timeout_seconds, 30);
    assert_eq!(settings.exporter.config_files.len(), 2);
    assert_eq!(settings.exporter.config_hash_namespace, "orch_edgenode");
    assert!(settings.vault.uris.is_empty());
    assert_eq!(settings.observability.log_level, "info");
}

#[test]
fn test_reloader_template_roundtrip_preserves_settings() {
    let temp_dir = create_temp_dir();
    let path = temp_dir.path().join("reloader.toml");

    write_template(reloader_config_template(), path.to_str()).expect("Failed to write template");
    let settings = ReloaderSettings::from_file(&path).expect("Template should load");

    assert_eq!(settings.server.listen_address.port(), 50051);
    assert_eq!(settings.request_timeout().as_secs(), 30);
    assert_eq!(settings.shutdown_timeout().as_secs(), 5);
    assert_eq!(
        settings.exporter.config_hash_endpoint,
        "http://localhost:9141/confighash"
    );
}

#[test]
fn test_write_to_nonexistent_parent_fails() {
    let temp_dir = create_temp_dir();
    let bad_path = temp_dir.path().join("nonexistent").join("exporter.toml");

    let err = write_template(exporter_config_template(), bad_path.to_str()).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
}

#[test]
fn test_write_overwrites_existing_file() {
    let temp_dir = create_temp_dir();
    let path = temp_dir.path().join("reloader.toml");
    fs::write(&path, "existing content").expect("Failed to create file");

    write_template(reloader_config_template(), path.to_str()).expect("Failed to write template");
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        reloader_config_template()
    );
}
