//! Per-credential client cache.
//!
//! Building a full client bundle is cheap but not free, and collaborators
//! hold connection pools worth reusing. The registry keeps one bundle per
//! credential identity and drops it on logout or credential change.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{Clients, EsploraClient, HttpExchangeClient, HttpLedgerClient, HttpMinterClient};
use crate::Result;
use crate::auth::Credential;
use crate::config::EndpointConfig;

/// Cache key used when no credential is configured.
const ANONYMOUS: &str = "anonymous";

/// Builds a [`Clients`] bundle for a credential.
pub trait ClientFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if any collaborator cannot be constructed.
    fn build(&self, credential: Option<&Credential>) -> Result<Clients>;
}

/// Factory for the reqwest-backed collaborators.
#[derive(Debug, Clone)]
pub struct HttpClientFactory {
    endpoints: EndpointConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl HttpClientFactory {
    pub fn new(endpoints: EndpointConfig, tls: Option<Arc<rustls::ClientConfig>>) -> Self {
        Self { endpoints, tls }
    }
}

impl ClientFactory for HttpClientFactory {
    fn build(&self, credential: Option<&Credential>) -> Result<Clients> {
        let tls = self.tls.as_deref();
        let e = &self.endpoints;
        Ok(Clients {
            exchange: Arc::new(HttpExchangeClient::new(
                &e.exchange_url,
                e.exchange_principal.clone(),
                credential.cloned(),
                tls,
            )?),
            ledger: Arc::new(HttpLedgerClient::new(&e.ledger_url, tls)?),
            minter: Arc::new(HttpMinterClient::new(&e.minter_url, tls)?),
            block_source: Arc::new(EsploraClient::new(&e.block_source_url, tls)?),
        })
    }
}

/// Caches one [`Clients`] bundle per credential identity.
pub struct ClientRegistry {
    factory: Arc<dyn ClientFactory>,
    cache: Mutex<HashMap<String, Clients>>,
}

impl ClientRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached bundle for `credential`, building it on first use.
    ///
    /// # Errors
    ///
    /// Propagates factory errors; nothing is cached on failure.
    pub fn get(&self, credential: Option<&Credential>) -> Result<Clients> {
        let key = identity_of(credential);
        let mut cache = self.cache.lock();
        if let Some(clients) = cache.get(&key) {
            return Ok(clients.clone());
        }
        let clients = self.factory.build(credential)?;
        debug!(identity = %short(&key), "Built client bundle");
        cache.insert(key, clients.clone());
        Ok(clients)
    }

    /// Drops the bundle for `credential`.
    pub fn invalidate(&self, credential: Option<&Credential>) {
        let key = identity_of(credential);
        if self.cache.lock().remove(&key).is_some() {
            info!(identity = %short(&key), "Invalidated client bundle");
        }
    }

    /// Drops every bundle.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("cached", &self.len())
            .finish_non_exhaustive()
    }
}

fn identity_of(credential: Option<&Credential>) -> String {
    credential.map_or_else(|| ANONYMOUS.to_string(), Credential::identity)
}

fn short(identity: &str) -> &str {
    &identity[..identity.len().min(12)]
}
