//! HTTP Bitcoin minter client.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{MinterClient, endpoint, http_client};
use crate::Result;
use crate::models::{ApiEnvelope, UpdateBalanceStatus, Utxo, WithdrawalStatus, u64_str};

#[derive(Debug, Clone)]
pub struct HttpMinterClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct OwnerArg<'a> {
    owner: &'a str,
}

#[derive(Serialize)]
struct BlockIndexArg {
    #[serde(with = "u64_str")]
    block_index: u64,
}

impl HttpMinterClient {
    /// # Errors
    ///
    /// Returns [`BatchSyncError::Tls`](crate::BatchSyncError::Tls) if the
    /// HTTP client cannot be built.
    pub fn new(base_url: &str, tls: Option<&rustls::ClientConfig>) -> Result<Self> {
        Ok(Self {
            http: http_client(tls)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn call<B: Serialize + Sync, T: DeserializeOwned>(&self, method: &str, body: &B) -> Result<T> {
        let url = endpoint(&self.base_url, &format!("/v1/minter/{method}"));
        debug!(%url, "Minter call");
        let envelope: ApiEnvelope<T> = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        envelope.into_result(method)
    }
}

#[async_trait]
impl MinterClient for HttpMinterClient {
    async fn list_known_utxos(&self, owner: &str) -> Result<Vec<Utxo>> {
        self.call("get_known_utxos", &OwnerArg { owner }).await
    }

    async fn update_balance(&self, owner: &str) -> Result<Vec<UpdateBalanceStatus>> {
        self.call("update_balance", &OwnerArg { owner }).await
    }

    async fn withdrawal_status(&self, block_index: u64) -> Result<WithdrawalStatus> {
        self.call("retrieve_btc_status", &BlockIndexArg { block_index }).await
    }
}
