//! Host-side wiring of the sync engine.
//!
//! The engine from `famsync-core` knows nothing about transport or storage.
//! This module supplies the collaborators for the CLI: a SQLite local store,
//! HTTP appliers and reconciler speaking to `famsync-server`, and an HTTP
//! health probe for connectivity.

pub mod applier;
pub mod client;
pub mod probe;
pub mod reconciler;

pub use applier::HttpApplier;
pub use client::RemoteClient;
pub use probe::HttpProbe;
pub use reconciler::HttpReconciler;

use famsync_core::{ApplierRegistry, ConnectivityMonitor, EntityType, SyncEngine, SyncError};
use std::sync::Arc;

use crate::config::Config;
use crate::db::{init_db, SqliteStore};

/// Builds an engine for the configured server and database.
///
/// The connectivity monitor starts `unknown`; callers either probe once with
/// `check_now` or start its polling loop.
pub async fn build_engine(config: &Config) -> Result<SyncEngine, SetupError> {
    let client = RemoteClient::from_config(&config.sync)?;
    let pool = init_db(&config.database_path.value).await?;
    let store = Arc::new(SqliteStore::new(pool));

    let monitor = Arc::new(ConnectivityMonitor::new(
        Arc::new(HttpProbe::new(client.clone())),
        config.connectivity.to_connectivity_config(),
    ));

    let applier = Arc::new(HttpApplier::new(client.clone()));
    let mut registry = ApplierRegistry::new();
    for entity_type in EntityType::known() {
        registry.register(entity_type, applier.clone());
    }

    let engine = SyncEngine::builder(store, monitor)
        .registry(registry)
        .reconciler(Arc::new(HttpReconciler::new(client.clone())))
        .config(config.engine.to_engine_config())
        .build()
        .await?;

    tracing::debug!(server = %client.base_url(), "Sync engine ready");
    Ok(engine)
}

/// Errors while assembling the engine
#[derive(Debug)]
pub enum SetupError {
    /// Sync is not configured
    NotConfigured,
    /// Local database could not be opened
    Database(sqlx::Error),
    /// Engine failed to load its queue
    Engine(SyncError),
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::NotConfigured => write!(
                f,
                "Sync not configured. Add sync.server_url and sync.api_key to config."
            ),
            SetupError::Database(e) => write!(f, "Database error: {}", e),
            SetupError::Engine(e) => write!(f, "Sync engine error: {}", e),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::NotConfigured => None,
            SetupError::Database(e) => Some(e),
            SetupError::Engine(e) => Some(e),
        }
    }
}

impl From<sqlx::Error> for SetupError {
    fn from(e: sqlx::Error) -> Self {
        SetupError::Database(e)
    }
}

impl From<SyncError> for SetupError {
    fn from(e: SyncError) -> Self {
        SetupError::Engine(e)
    }
}
