//! HTTP exchange client.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::{ExchangeClient, endpoint, http_client};
use crate::auth::{Credential, next_nonce};
use crate::fixed_point::Amount;
use crate::models::{
    ApiEnvelope, ClearingPrice, CreditEntry, LedgerId, NotifyResult, OpenOrder, OrderAck,
    OrderId, OrderSettings, PlaceOrderRequest, ReplaceOrderRequest, SessionDescriptor,
};
use crate::{BatchSyncError, Result};

/// Exchange REST client.
///
/// Public queries are plain GETs. Private calls are POSTs whose JSON body
/// carries a `nonce` and are signed with the credential.
#[derive(Debug, Clone)]
pub struct HttpExchangeClient {
    http: reqwest::Client,
    base_url: String,
    principal: String,
    credential: Option<Credential>,
}

impl HttpExchangeClient {
    /// # Errors
    ///
    /// Returns [`BatchSyncError::Tls`] if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        principal: impl Into<String>,
        credential: Option<Credential>,
        tls: Option<&rustls::ClientConfig>,
    ) -> Result<Self> {
        Ok(Self {
            http: http_client(tls)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            principal: principal.into(),
            credential,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn public<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = endpoint(&self.base_url, path);
        debug!(%url, "Exchange query");
        let envelope: ApiEnvelope<T> = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        envelope.into_result(path)
    }

    async fn private<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let credential = self.credential.as_ref().ok_or_else(|| {
            BatchSyncError::Config(format!("{path} requires API credentials"))
        })?;

        let nonce = next_nonce();
        let mut payload = serde_json::to_value(body)?;
        if payload.is_null() {
            payload = json!({});
        }
        let Some(fields) = payload.as_object_mut() else {
            return Err(BatchSyncError::MalformedMessage(format!(
                "{path} body must be a JSON object"
            )));
        };
        fields.insert("nonce".into(), json!(nonce));
        let body = serde_json::to_string(&payload)?;
        let signature = credential.sign(path, nonce, &body)?;

        let url = endpoint(&self.base_url, path);
        debug!(%url, nonce, "Exchange private call");
        let envelope: ApiEnvelope<T> = self
            .http
            .post(&url)
            .header("API-Key", credential.api_key())
            .header("API-Sign", signature)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        envelope.into_result(path)
    }
}

#[derive(Serialize)]
struct LedgerBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    ledger: Option<&'a LedgerId>,
}

#[async_trait]
impl ExchangeClient for HttpExchangeClient {
    fn principal(&self) -> &str {
        &self.principal
    }

    async fn query_assets(&self) -> Result<Vec<LedgerId>> {
        self.public("/v1/public/assets").await
    }

    async fn query_quote_ledger(&self) -> Result<LedgerId> {
        self.public("/v1/public/quote_ledger").await
    }

    async fn query_settings(&self) -> Result<OrderSettings> {
        self.public("/v1/public/settings").await
    }

    async fn query_next_session(&self) -> Result<SessionDescriptor> {
        self.public("/v1/public/next_session").await
    }

    async fn query_clearing_prices(&self) -> Result<Vec<ClearingPrice>> {
        self.public("/v1/public/clearing_prices").await
    }

    async fn query_open_orders(&self) -> Result<Vec<OpenOrder>> {
        self.private("/v1/private/open_orders", &json!({})).await
    }

    async fn query_credits(&self, ledger: Option<&LedgerId>) -> Result<Vec<CreditEntry>> {
        self.private("/v1/private/credits", &LedgerBody { ledger }).await
    }

    async fn query_tracked_deposit(&self, ledger: &LedgerId) -> Result<Amount> {
        self.private("/v1/private/tracked_deposit", &LedgerBody { ledger: Some(ledger) })
            .await
    }

    async fn notify_deposit(&self, ledger: &LedgerId) -> Result<NotifyResult> {
        self.private("/v1/private/notify_deposit", &LedgerBody { ledger: Some(ledger) })
            .await
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck> {
        self.private("/v1/private/place_order", request).await
    }

    async fn replace_order(&self, request: &ReplaceOrderRequest) -> Result<OrderAck> {
        self.private("/v1/private/replace_order", request).await
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<()> {
        let _: OrderAck = self
            .private("/v1/private/cancel_order", &json!({ "order_id": order_id }))
            .await?;
        Ok(())
    }
}
