use std::sync::Arc;

use batchsync::clients::{ClientRegistry, HttpClientFactory};
use batchsync::config::{EndpointOverrides, fetch_config};
use batchsync::events::Notifier;
use batchsync::store::JsonFileStore;
use batchsync::timer::SystemClock;
use batchsync::tls::build_tls_config;
use batchsync::{BatchSyncError, EngineOptions, SyncEngine};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), BatchSyncError> {
    // Initialize tracing subscriber for logging output.
    tracing_subscriber::fmt::init();

    let mut app_config = fetch_config()?;
    let store = Arc::new(JsonFileStore::open(&app_config.state_dir)?);
    if let Some(overrides) = EndpointOverrides::load(store.as_ref())? {
        app_config.apply_overrides(&overrides);
    }

    let user = app_config
        .principal
        .clone()
        .ok_or_else(|| BatchSyncError::Config("BATCHSYNC_PRINCIPAL is required".into()))?;
    let tls = app_config
        .ca_bundle
        .as_deref()
        .map(build_tls_config)
        .transpose()?
        .map(Arc::new);

    let factory = HttpClientFactory::new(app_config.endpoints.clone(), tls);
    let registry = Arc::new(ClientRegistry::new(Arc::new(factory)));
    let (notifier, mut events) = Notifier::channel();

    let engine = SyncEngine::new(
        EngineOptions {
            user,
            btc_address: app_config.btc_address.clone(),
            credential: app_config.credential.clone(),
        },
        registry,
        store,
        Arc::new(SystemClock),
        notifier,
    )?;
    engine.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => info!(?event, "Sync event"),
                None => break,
            },
        }
        if engine.is_logged_out() {
            break;
        }
    }

    engine.dispose();
    Ok(())
}
