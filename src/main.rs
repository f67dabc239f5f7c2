use std::path::PathBuf;
use std::sync::Arc;

use beacon_server::{push_from_settings, Collaborators, ServerConfig, StaticTokenAuth};
use beacon_settings::{load_settings, load_settings_from_path, resolve_path};
use beacon_store::{Database, IncidentRepo};
use beacon_telemetry::{init_telemetry, TelemetryConfig};
use clap::Parser;

/// Neighbourhood incident alert relay.
#[derive(Parser, Debug)]
#[command(name = "beacon", version, about)]
struct Cli {
    /// Settings file (defaults to ~/.beacon/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port, overriding settings.
    #[arg(long)]
    port: Option<u16>,

    /// Fan-out radius in kilometres, overriding settings.
    #[arg(long)]
    radius_km: Option<f64>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    };
    let mut settings = match settings {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to load settings: {e}");
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(radius) = cli.radius_km.filter(|r| r.is_finite() && *r > 0.0) {
        settings.fanout.radius_km = radius;
    }

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: settings
            .telemetry
            .log_level
            .parse()
            .unwrap_or(tracing::Level::INFO),
        log_to_sqlite: settings.telemetry.log_to_sqlite,
        log_db_path: resolve_path(&settings.telemetry.log_db_path),
        ..TelemetryConfig::default()
    });

    let db_path = resolve_path(&settings.store.path);
    let db = Database::open(&db_path).expect("failed to open database");

    let push = push_from_settings(&settings.push).expect("failed to build push client");
    let auth = StaticTokenAuth::from_settings(&settings.auth);
    tracing::info!(tokens = auth.len(), "auth configured");

    let collab = Collaborators {
        store: Arc::new(IncidentRepo::new(db)),
        push,
        auth: (!auth.is_empty()).then(|| Arc::new(auth) as Arc<dyn beacon_server::Authenticator>),
        metrics: telemetry.metrics(),
    };

    let handle = beacon_server::start(ServerConfig::from_settings(&settings), collab)
        .await
        .expect("failed to start server");
    tracing::info!(port = handle.port, "beacon ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
    handle.shutdown().await;

    if let Some(logs) = telemetry.logs() {
        match logs.count() {
            Ok(persisted) => tracing::info!(persisted, "persisted warn+ log records"),
            Err(e) => tracing::warn!(error = %e, "could not count persisted logs"),
        }
    }
}
