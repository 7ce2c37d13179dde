pub mod ca;
pub mod config;
pub mod crypto;
pub mod database;
pub mod diagnostics;
pub mod error;
pub mod key_store;
pub mod secret;
pub mod service;
pub mod tpm;
pub mod types;

pub use error::{Error, Result};
pub use service::{AttestationService, Components};

use std::sync::Arc;
use std::time::Duration;

pub async fn run(cfg: config::Config) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    let level = match cfg.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();

    tracing::info!("Starting attestationd");

    let data_dir = directories::ProjectDirs::from("", "", "attestationd")
        .ok_or_else(|| anyhow::anyhow!("cannot determine XDG data dir"))?
        .data_dir()
        .to_path_buf();
    let database_path = cfg
        .database_path
        .clone()
        .unwrap_or_else(|| data_dir.join("attestation.epb"));

    diagnostics::check(&cfg, &database_path)?;
    std::fs::create_dir_all(&data_dir)?;

    // Single-instance lock: two workers would race on the TPM and the database
    let lock_dir = std::env::var("XDG_RUNTIME_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| data_dir.clone());
    let lock_path = lock_dir.join("attestationd.lock");
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    let mut lock = fd_lock::RwLock::new(lock_file);
    let _guard = lock.try_write().map_err(|_| {
        anyhow::anyhow!(
            "attestationd is already running (lock: {})",
            lock_path.display()
        )
    })?;

    let ca_public_key = match &cfg.ca_public_key {
        Some(path) => Some(std::fs::read(path)?),
        None => None,
    };

    let tpm: Arc<dyn tpm::TpmUtility> = Arc::new(tpm::TpmUtilityImpl::new(cfg.tpm_device.clone()));
    let crypto: Arc<dyn crypto::CryptoUtility> =
        Arc::new(crypto::CryptoUtilityImpl::new(tpm.clone()));
    let database = database::DatabaseImpl::new(
        crypto.clone(),
        Box::new(database::FileIo::new(database_path.clone())),
    );
    let key_store = key_store::Pkcs11KeyStore::open(
        &cfg.pkcs11_module,
        Box::new(key_store::TokenLabelManager::new(cfg.system_token_label.clone())),
    )
    .map_err(|e| anyhow::anyhow!("Failed to open PKCS#11 module: {e}"))?;
    let transport = ca::ReqwestTransport::new(
        tokio::runtime::Handle::current(),
        Duration::from_secs(cfg.ca_timeout_secs),
    )?;

    let service = AttestationService::start(
        Components {
            tpm,
            crypto,
            database: Box::new(database),
            key_store: Box::new(key_store),
            transport: Box::new(transport),
        },
        config::ServiceConfig {
            ca_origin: cfg.ca_origin.clone(),
            ca_public_key,
            ca_key_id: cfg.ca_key_id.clone(),
        },
    )?;
    tracing::info!(database = %database_path.display(), ca = %cfg.ca_origin, "attestation service started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    drop(service);
    Ok(())
}
