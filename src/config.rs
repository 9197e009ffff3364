//! Application configuration loaded from environment variables.
//!
//! Endpoints:
//! - `BATCHSYNC_EXCHANGE_URL`, `BATCHSYNC_EXCHANGE_PRINCIPAL`
//! - `BATCHSYNC_LEDGER_URL`
//! - `BATCHSYNC_MINTER_URL`
//! - `BATCHSYNC_BLOCK_SOURCE_URL` (defaults to Blockstream mainnet)
//!
//! Account and state:
//! - `BATCHSYNC_PRINCIPAL`: the user whose deposits are reconciled
//! - `BATCHSYNC_BTC_ADDRESS`: Bitcoin deposit address to watch
//! - `BATCHSYNC_STATE_DIR`: directory for persisted state
//!
//! Credentials are optional (read-only mode) but when one is set both must
//! be present:
//! - `BATCHSYNC_API_KEY`, `BATCHSYNC_API_SECRET`
//! - `BATCHSYNC_DELEGATION_EXPIRY`: RFC 3339 expiry of a delegated key
//!
//! `BATCHSYNC_CA_BUNDLE` optionally pins the TLS roots to a PEM file.
//! Endpoints persisted under `endpoint-overrides` win over the environment.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Credential;
use crate::clients::esplora;
use crate::store::{self, KvStore, StoreKey};

const DEFAULT_EXCHANGE_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_EXCHANGE_PRINCIPAL: &str = "exchange";
const DEFAULT_LEDGER_URL: &str = "http://127.0.0.1:8081";
const DEFAULT_MINTER_URL: &str = "http://127.0.0.1:8082";
const DEFAULT_STATE_DIR: &str = ".batchsync";

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub endpoints: EndpointConfig,
    pub principal: Option<String>,
    pub btc_address: Option<String>,
    pub credential: Option<Credential>,
    pub state_dir: PathBuf,
    pub ca_bundle: Option<PathBuf>,
}

/// Base URLs of every collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub exchange_url: String,
    pub exchange_principal: String,
    pub ledger_url: String,
    pub minter_url: String,
    pub block_source_url: String,
}

/// Endpoint overrides persisted by the user. Unset fields keep the
/// configured value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minter_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_source_url: Option<String>,
}

impl EndpointOverrides {
    /// Reads the persisted overrides, if any.
    ///
    /// # Errors
    ///
    /// Propagates store and JSON errors.
    pub fn load(store: &dyn KvStore) -> crate::Result<Option<Self>> {
        store::load_json(store, &StoreKey::endpoint_overrides())
    }

    /// # Errors
    ///
    /// Propagates store and JSON errors.
    pub fn save(&self, store: &dyn KvStore) -> crate::Result<()> {
        store::save_json(store, &StoreKey::endpoint_overrides(), self)
    }
}

impl AppConfig {
    /// Applies non-empty overrides on top of the environment values.
    pub fn apply_overrides(&mut self, overrides: &EndpointOverrides) {
        let pick = |target: &mut String, value: &Option<String>| {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                *target = v.to_string();
            }
        };
        pick(&mut self.endpoints.exchange_url, &overrides.exchange_url);
        pick(&mut self.endpoints.ledger_url, &overrides.ledger_url);
        pick(&mut self.endpoints.minter_url, &overrides.minter_url);
        pick(&mut self.endpoints.block_source_url, &overrides.block_source_url);
    }
}

/// Loads the application configuration from environment variables.
///
/// # Errors
///
/// Returns [`BatchSyncError::Config`](crate::BatchSyncError::Config) if
/// only one of the two credential variables is set, or if the delegation
/// expiry is not RFC 3339.
pub fn fetch_config() -> crate::Result<AppConfig> {
    let endpoints = EndpointConfig {
        exchange_url: non_empty_var("BATCHSYNC_EXCHANGE_URL")
            .unwrap_or_else(|| DEFAULT_EXCHANGE_URL.to_string()),
        exchange_principal: non_empty_var("BATCHSYNC_EXCHANGE_PRINCIPAL")
            .unwrap_or_else(|| DEFAULT_EXCHANGE_PRINCIPAL.to_string()),
        ledger_url: non_empty_var("BATCHSYNC_LEDGER_URL")
            .unwrap_or_else(|| DEFAULT_LEDGER_URL.to_string()),
        minter_url: non_empty_var("BATCHSYNC_MINTER_URL")
            .unwrap_or_else(|| DEFAULT_MINTER_URL.to_string()),
        block_source_url: non_empty_var("BATCHSYNC_BLOCK_SOURCE_URL")
            .unwrap_or_else(|| esplora::MAINNET_URL.to_string()),
    };

    let api_key = non_empty_var("BATCHSYNC_API_KEY");
    let api_secret = non_empty_var("BATCHSYNC_API_SECRET");

    let credential = match (api_key, api_secret) {
        (Some(_), None) => {
            return Err(crate::BatchSyncError::Config(
                "BATCHSYNC_API_KEY is set but BATCHSYNC_API_SECRET is missing".to_string(),
            ));
        }
        (None, Some(_)) => {
            return Err(crate::BatchSyncError::Config(
                "BATCHSYNC_API_SECRET is set but BATCHSYNC_API_KEY is missing".to_string(),
            ));
        }
        (Some(key), Some(secret)) => Some(Credential::new(key, secret)),
        (None, None) => None,
    };

    let credential = match (credential, non_empty_var("BATCHSYNC_DELEGATION_EXPIRY")) {
        (Some(credential), Some(raw)) => Some(credential.with_expiry(parse_expiry(&raw)?)),
        (credential, _) => credential,
    };

    Ok(AppConfig {
        endpoints,
        principal: non_empty_var("BATCHSYNC_PRINCIPAL"),
        btc_address: non_empty_var("BATCHSYNC_BTC_ADDRESS"),
        credential,
        state_dir: non_empty_var("BATCHSYNC_STATE_DIR")
            .map_or_else(|| PathBuf::from(DEFAULT_STATE_DIR), PathBuf::from),
        ca_bundle: non_empty_var("BATCHSYNC_CA_BUNDLE").map(PathBuf::from),
    })
}

fn parse_expiry(raw: &str) -> crate::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            crate::BatchSyncError::Config(format!(
                "BATCHSYNC_DELEGATION_EXPIRY {raw:?} is not RFC 3339: {e}"
            ))
        })
}

/// Returns the value of an environment variable if it exists and is non-empty.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const ALL_VARS: [&str; 12] = [
        "BATCHSYNC_EXCHANGE_URL",
        "BATCHSYNC_EXCHANGE_PRINCIPAL",
        "BATCHSYNC_LEDGER_URL",
        "BATCHSYNC_MINTER_URL",
        "BATCHSYNC_BLOCK_SOURCE_URL",
        "BATCHSYNC_STATE_DIR",
        "BATCHSYNC_PRINCIPAL",
        "BATCHSYNC_BTC_ADDRESS",
        "BATCHSYNC_API_KEY",
        "BATCHSYNC_API_SECRET",
        "BATCHSYNC_DELEGATION_EXPIRY",
        "BATCHSYNC_CA_BUNDLE",
    ];

    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    /// Helper that clears every config var, sets `vars`, runs `f`, then
    /// restores the originals.
    ///
    /// # Safety
    ///
    /// Env mutation is serialized through `ENV_LOCK`; no other test in
    /// this crate reads these variables.
    fn with_env<F: FnOnce()>(vars: &[(&str, Option<&str>)], f: F) {
        let _guard = ENV_LOCK.lock();
        let originals: Vec<(&str, Option<String>)> = ALL_VARS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        for k in ALL_VARS {
            // SAFETY: serialized by ENV_LOCK (see above).
            unsafe { std::env::remove_var(k) };
        }
        for (k, v) in vars {
            // SAFETY: serialized by ENV_LOCK (see above).
            unsafe {
                match v {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }

        f();

        for (k, original) in originals {
            // SAFETY: restoring original values, same serialized context.
            unsafe {
                match original {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn defaults_without_env_vars() {
        with_env(&[], || {
            let config = fetch_config().unwrap();
            assert_eq!(config.endpoints.exchange_url, DEFAULT_EXCHANGE_URL);
            assert_eq!(config.endpoints.block_source_url, esplora::MAINNET_URL);
            assert_eq!(config.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
            assert!(config.credential.is_none());
            assert!(config.principal.is_none());
        });
    }

    #[test]
    fn loads_credentials_with_expiry() {
        with_env(
            &[
                ("BATCHSYNC_API_KEY", Some("test-key")),
                ("BATCHSYNC_API_SECRET", Some("dGVzdA==")),
                ("BATCHSYNC_DELEGATION_EXPIRY", Some("2026-01-01T00:00:00Z")),
            ],
            || {
                let config = fetch_config().unwrap();
                let credential = config.credential.unwrap();
                assert_eq!(credential.api_key(), "test-key");
                assert_eq!(
                    credential.expires_at().map(|t| t.to_rfc3339()),
                    Some("2026-01-01T00:00:00+00:00".to_string())
                );
            },
        );
    }

    #[test]
    fn rejects_bad_expiry() {
        with_env(
            &[
                ("BATCHSYNC_API_KEY", Some("test-key")),
                ("BATCHSYNC_API_SECRET", Some("dGVzdA==")),
                ("BATCHSYNC_DELEGATION_EXPIRY", Some("tomorrow")),
            ],
            || {
                let err = fetch_config().unwrap_err();
                assert!(err.to_string().contains("not RFC 3339"));
            },
        );
    }

    #[test]
    fn rejects_key_without_secret() {
        with_env(&[("BATCHSYNC_API_KEY", Some("key-only"))], || {
            let err = fetch_config().unwrap_err();
            assert!(err.to_string().contains("BATCHSYNC_API_SECRET is missing"));
        });
    }

    #[test]
    fn rejects_secret_without_key() {
        with_env(&[("BATCHSYNC_API_SECRET", Some("secret-only"))], || {
            let err = fetch_config().unwrap_err();
            assert!(err.to_string().contains("BATCHSYNC_API_KEY is missing"));
        });
    }

    #[test]
    fn empty_values_treated_as_absent() {
        with_env(
            &[
                ("BATCHSYNC_API_KEY", Some("")),
                ("BATCHSYNC_API_SECRET", Some("")),
                ("BATCHSYNC_EXCHANGE_URL", Some("")),
            ],
            || {
                let config = fetch_config().unwrap();
                assert_eq!(config.endpoints.exchange_url, DEFAULT_EXCHANGE_URL);
                assert!(config.credential.is_none());
            },
        );
    }

    #[test]
    fn persisted_overrides_win() {
        with_env(&[("BATCHSYNC_MINTER_URL", Some("https://minter.example"))], || {
            let store = MemoryStore::new();
            EndpointOverrides {
                exchange_url: Some("https://auction.example".into()),
                ledger_url: Some(String::new()),
                ..EndpointOverrides::default()
            }
            .save(&store)
            .unwrap();

            let mut config = fetch_config().unwrap();
            let overrides = EndpointOverrides::load(&store).unwrap().unwrap();
            config.apply_overrides(&overrides);

            assert_eq!(config.endpoints.exchange_url, "https://auction.example");
            assert_eq!(config.endpoints.ledger_url, DEFAULT_LEDGER_URL);
            assert_eq!(config.endpoints.minter_url, "https://minter.example");
        });
    }
}
