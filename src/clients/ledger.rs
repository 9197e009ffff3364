//! HTTP token-ledger client.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{LedgerClient, endpoint, http_client};
use crate::Result;
use crate::fixed_point::Amount;
use crate::models::{Account, ApiEnvelope, LedgerId, LedgerMetadata};

/// Client for a gateway that fronts every token ledger under
/// `/v1/ledgers/<ledger-id>/...`.
#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct BalanceQuery<'a> {
    account: &'a Account,
}

#[derive(Serialize)]
struct AllowanceQuery<'a> {
    account: &'a Account,
    spender: &'a Account,
}

impl HttpLedgerClient {
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

    async fn query<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        ledger: &LedgerId,
        method: &str,
        body: &B,
    ) -> Result<T> {
        let url = endpoint(&self.base_url, &format!("/v1/ledgers/{ledger}/{method}"));
        debug!(%url, "Ledger query");
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
impl LedgerClient for HttpLedgerClient {
    async fn metadata(&self, ledger: &LedgerId) -> Result<LedgerMetadata> {
        self.query(ledger, "metadata", &serde_json::json!({})).await
    }

    async fn balance_of(&self, ledger: &LedgerId, account: &Account) -> Result<Amount> {
        self.query(ledger, "balance_of", &BalanceQuery { account }).await
    }

    async fn allowance(&self, ledger: &LedgerId, owner: &Account, spender: &Account) -> Result<Amount> {
        self.query(
            ledger,
            "allowance",
            &AllowanceQuery {
                account: owner,
                spender,
            },
        )
        .await
    }
}
