//! Synergy Proxy Command Line Tool
//!
//! Loads settings, opens the certificate authority, restores persisted
//! proxies and serves the management API until Ctrl+C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use synergy_proxy::admin::{start_admin_server, AdminState};
use synergy_proxy::common::{init_logger, Result};
use synergy_proxy::config::{Overrides, ProxyStore, SynergyConfig};
use synergy_proxy::handshake::BlockPalette;
use synergy_proxy::protocol::ServiceRegistry;
use synergy_proxy::proxy::{ProxyContext, Settings, Supervisor};
use synergy_proxy::tls::{CertificateAuthority, UpstreamTls};
use synergy_proxy::{APP_NAME, VERSION};

/// Synergy Proxy: protocol-aware intercepting proxy
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Load configuration from a JSON file
    #[clap(long, env = "SYNERGY_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Management API listen address
    #[clap(long)]
    admin_listen: Option<SocketAddr>,

    /// Directory holding the keystore and persisted proxies
    #[clap(long)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[clap(long)]
    log_level: Option<String>,

    /// Outbound connect timeout in seconds
    #[clap(long)]
    connect_timeout: Option<u64>,

    /// Login handshake timeout in seconds
    #[clap(long)]
    handshake_timeout: Option<u64>,

    /// Verify upstream TLS certificates
    #[clap(long)]
    verify_upstream: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            admin_listen: self.admin_listen,
            data_dir: self.data_dir.clone(),
            log_level: self.log_level.clone(),
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            verify_upstream: self.verify_upstream,
        }
    }
}

fn build_context(config: &SynergyConfig) -> Result<ProxyContext> {
    let keystore = config.keystore_path();
    let authority = CertificateAuthority::open_path(&keystore, &config.keystore_password)?;
    info!("Certificate authority loaded from {}", keystore.display());

    let mut context = ProxyContext::new(
        Settings::from_config(config),
        Arc::new(authority),
        UpstreamTls::new(config.verify_upstream)?,
    );
    if let Some(path) = &config.registry_file {
        context = context.with_registry(ServiceRegistry::load(path)?);
    }
    if let Some(path) = &config.palette_file {
        context = context.with_palette(BlockPalette::load(path)?);
    }
    Ok(context)
}

/// Register and start every persisted proxy
fn restore(supervisor: &Supervisor, store: &ProxyStore) -> Result<()> {
    for definition in store.load()? {
        let id = definition.id().to_string();
        match supervisor.add(definition) {
            Ok(true) => {}
            Ok(false) => {
                warn!("Skipping duplicate persisted proxy {}", id);
                continue;
            }
            Err(e) => {
                warn!("Skipping invalid persisted proxy {}: {}", id, e);
                continue;
            }
        }
        if let Err(e) = supervisor.start(&id) {
            warn!("Persisted proxy {} did not start: {}", id, e);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    let config = SynergyConfig::load(args.config_file.as_deref())?.apply_overrides(args.overrides());

    // Initialize logger
    init_logger(&config.log_level);
    info!("Starting {} v{}", APP_NAME, VERSION);

    config.validate()?;
    info!("Data directory: {}", config.data_dir.display());

    let supervisor = Arc::new(Supervisor::new(Arc::new(build_context(&config)?)));
    let store = ProxyStore::new(config.proxies_path());
    restore(&supervisor, &store)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let state = AdminState::new(Arc::clone(&supervisor), Some(store));
    let admin_listen = config.admin_listen;
    let admin = tokio::spawn(async move {
        let shutdown = async {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = start_admin_server(admin_listen, state, shutdown).await {
            error!("Admin API server failed: {}", e);
        }
    });

    info!("Proxy service ready, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    let _ = shutdown_tx.send(());
    supervisor.stop_all().await;
    if let Err(e) = admin.await {
        error!("Admin API task failed: {}", e);
    }
    Ok(())
}
