//! Clinic records daemon
//!
//! Serves the staff JSON API and the patient consent portal over one
//! SQLite database.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! clinic-records
//!
//! # Start with custom config
//! clinic-records --config /path/to/config.toml
//!
//! # Custom port and data directory
//! clinic-records --http-port 8091 --data-dir /srv/clinic
//!
//! # Keep tokens redeemable after consent
//! clinic-records --redemption-policy permissive
//! ```

use clap::Parser;
use clinic_records::services::{spawn_audit_listener, RedemptionPolicy};
use clinic_records::{ClinicDb, Config, HttpServer, Services};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "clinic-records")]
#[command(about = "Clinical record ledger and patient consent portal")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the database
    #[arg(long, env = "CLINIC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "CLINIC_HTTP_PORT")]
    http_port: Option<u16>,

    /// Address to bind the HTTP API to
    #[arg(long)]
    bind_address: Option<String>,

    /// Public origin used in portal links, e.g. https://clinic.example
    #[arg(long, env = "CLINIC_PORTAL_BASE_URL")]
    portal_base_url: Option<String>,

    /// Token redemption policy: strict or permissive
    #[arg(long, env = "CLINIC_REDEMPTION_POLICY")]
    redemption_policy: Option<RedemptionPolicy>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("clinic_records=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(addr) = args.bind_address {
        config.bind_address = addr;
    }
    if let Some(url) = args.portal_base_url {
        config.portal_base_url = url;
    }
    if let Some(policy) = args.redemption_policy {
        config.redemption_policy = policy;
    }

    info!(
        data_dir = %config.data_dir.display(),
        http_port = config.http_port,
        redemption_policy = %config.redemption_policy,
        "Starting clinic-records"
    );

    tokio::fs::create_dir_all(&config.data_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(ClinicDb::open(&config.data_dir)?);
    let services = Arc::new(Services::new(db.clone(), config.service_options()));
    let audit_handle = spawn_audit_listener(services.events.clone(), db.clone());

    let http_addr: SocketAddr = format!("{}:{}", config.bind_address, config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(services.clone(), http_addr));

    info!("HTTP API available at http://{}", http_addr);
    info!("Portal links use {}", config.portal_base_url);
    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    audit_handle.abort();

    if let Ok(stats) = db.stats() {
        info!(
            patients = stats.patient_count,
            records = stats.record_count,
            pending_consent = stats.pending_consent_count,
            "Final database stats"
        );
    }

    Ok(())
}
