//! Esplora block-source client (Blockstream-compatible API).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{BlockSource, endpoint, http_client};
use crate::models::Utxo;
use crate::{BatchSyncError, Result};

/// Esplora API endpoints
pub const MAINNET_URL: &str = "https://blockstream.info/api";
pub const TESTNET_URL: &str = "https://blockstream.info/testnet/api";

#[derive(Debug, Clone)]
pub struct EsploraClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
    status: EsploraStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    block_height: Option<u64>,
    block_time: Option<i64>,
}

impl EsploraClient {
    /// # Errors
    ///
    /// Returns [`BatchSyncError::Tls`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, tls: Option<&rustls::ClientConfig>) -> Result<Self> {
        Ok(Self {
            http: http_client(tls)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current blockchain tip height.
    ///
    /// # Errors
    ///
    /// Returns an HTTP error or [`BatchSyncError::MalformedMessage`] if the
    /// body is not an integer.
    pub async fn tip_height(&self) -> Result<u64> {
        let url = endpoint(&self.base_url, "/blocks/tip/height");
        let text = self.http.get(&url).send().await?.error_for_status()?.text().await?;
        text.trim()
            .parse()
            .map_err(|e| BatchSyncError::MalformedMessage(format!("invalid tip height {text:?}: {e}")))
    }
}

/// Confirmations of an output mined at `height` when the tip is at `tip`.
fn confirmations(tip: u64, height: Option<u64>) -> u32 {
    match height {
        Some(h) => u32::try_from(tip.saturating_sub(h) + 1).unwrap_or(u32::MAX),
        None => 0,
    }
}

fn into_utxo(raw: EsploraUtxo, tip: u64) -> Utxo {
    let height = raw.status.confirmed.then_some(raw.status.block_height).flatten();
    Utxo {
        txid: raw.txid,
        vout: raw.vout,
        amount: raw.value,
        block_time: raw
            .status
            .block_time
            .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
        confirmations: confirmations(tip, height),
    }
}

#[async_trait]
impl BlockSource for EsploraClient {
    async fn list_utxos(&self, address: &str) -> Result<Vec<Utxo>> {
        let url = endpoint(&self.base_url, &format!("/address/{address}/utxo"));
        let raw: Vec<EsploraUtxo> = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // Get current height for confirmation calculation
        let tip = self.tip_height().await?;
        debug!(address, tip, count = raw.len(), "Fetched address UTXOs");

        Ok(raw.into_iter().map(|u| into_utxo(u, tip)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmations_count_the_including_block() {
        assert_eq!(confirmations(100, Some(100)), 1);
        assert_eq!(confirmations(105, Some(100)), 6);
        assert_eq!(confirmations(100, None), 0);
        // Tip lagging behind a freshly mined block still counts one.
        assert_eq!(confirmations(99, Some(100)), 1);
    }

    #[test]
    fn parses_esplora_utxo_listing() {
        let raw: Vec<EsploraUtxo> = serde_json::from_str(
            r#"[
                {"txid": "a1", "vout": 0, "value": 50000,
                 "status": {"confirmed": true, "block_height": 850000, "block_hash": "00ab", "block_time": 1718000000}},
                {"txid": "b2", "vout": 1, "value": 1200, "status": {"confirmed": false}}
            ]"#,
        )
        .unwrap();
        let utxos: Vec<Utxo> = raw.into_iter().map(|u| into_utxo(u, 850_009)).collect();

        assert_eq!(utxos[0].confirmations, 10);
        assert_eq!(utxos[0].block_time.map(|t| t.timestamp()), Some(1_718_000_000));
        assert_eq!(utxos[1].confirmations, 0);
        assert!(utxos[1].block_time.is_none());
    }
}
