//! Metrics exporter
//!
//! Serves one metrics endpoint per configuration document and hot-reloads them
//! on `POST /reload` or SIGHUP.

use clap::Parser;
use sre_exporter::cli::{Command, ExporterCli, exporter_config_template, write_template};
use sre_exporter::config::{ExporterSettings, Settings};
use sre_exporter::{exporter, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = ExporterCli::parse();

    if let Some(Command::Config { output }) = cli.command {
        write_template(exporter_config_template(), output.as_deref())?;
        return Ok(());
    }

    let settings = ExporterSettings::from_file(&cli.config)?;
    telemetry::init(&settings.observability.log_level);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        settings = %cli.config,
        "Metrics exporter starting"
    );

    if let Err(e) = exporter::run(settings).await {
        tracing::error!(error = %e, "Metrics exporter stopped with error");
        return Err(e.into());
    }

    tracing::info!("Shutdown completed");
    Ok(())
}
