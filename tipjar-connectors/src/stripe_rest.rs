//! Stripe REST API Client for card charges
//!
//! Provides REST API integration for:
//! - Creating charges with an application (platform) fee
//! - Looking up a charge by idempotency key after a timeout
//! - Refunding charges
//! - Fetching balance transactions (settlement records)
//!
//! # Authentication
//!
//! Stripe uses a secret key sent as a bearer token. Mutating requests are
//! form-encoded and carry an `Idempotency-Key` header; the key is also stored
//! in the charge metadata so it can be searched.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use tipjar_domain::Currency;
use tipjar_engine::{FeeDetail, Settlement};
use tipjar_exec::{ChargeReceipt, ChargeRequest, ExecError, PaymentProcessor, RefundReceipt};

// =============================================================================
// Constants
// =============================================================================

/// Stripe REST API base URL
const STRIPE_API_URL: &str = "https://api.stripe.com";

/// Request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Metadata field holding our idempotency key
const IDEMPOTENCY_METADATA: &str = "idempotency_key";

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in the Stripe REST client.
#[derive(Debug, Clone, Error)]
pub enum StripeRestError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    /// API returned error
    #[error("Stripe API error ({status}): {kind} - {message}")]
    ApiError { status: u16, kind: String, message: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Request timed out
    #[error("Request timed out")]
    Timeout,

    /// Response lacks a field we need
    #[error("Missing field in response: {0}")]
    MissingField(&'static str),
}

impl From<StripeRestError> for ExecError {
    fn from(error: StripeRestError) -> Self {
        match error {
            StripeRestError::Timeout => ExecError::Timeout("Stripe request timed out".to_string()),
            other => ExecError::Gateway(other.to_string()),
        }
    }
}

// =============================================================================
// Stripe REST Client
// =============================================================================

/// Stripe REST API client.
pub struct StripeRestClient {
    /// HTTP client
    client: Client,
    /// Secret API key
    secret_key: String,
    /// API base URL (overridable for tests and mocks)
    base_url: String,
}

impl StripeRestClient {
    /// Create a new Stripe REST client.
    pub fn new(secret_key: String) -> Self {
        Self::with_base_url(secret_key, STRIPE_API_URL.to_string())
    }

    /// Create a client against another API host (mock servers).
    pub fn with_base_url(secret_key: String, base_url: String) -> Self {
        Self { client: Client::new(), secret_key, base_url }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), endpoint)
    }

    /// Send a request and decode the JSON body.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, StripeRestError> {
        let response = timeout(
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
            request.bearer_auth(&self.secret_key).send(),
        )
        .await
        .map_err(|_| StripeRestError::Timeout)?
        .map_err(|e| {
            if e.is_timeout() {
                StripeRestError::Timeout
            } else {
                StripeRestError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| StripeRestError::ParseError(e.to_string()))?;

        if !status.is_success() {
            // Try to parse Stripe error response
            if let Ok(err) = serde_json::from_str::<StripeErrorResponse>(&body) {
                return Err(StripeRestError::ApiError {
                    status: status.as_u16(),
                    kind: err.error.kind,
                    message: err.error.message.unwrap_or_default(),
                });
            }
            return Err(StripeRestError::RequestFailed(format!("HTTP {}: {}", status, body)));
        }

        serde_json::from_str(&body).map_err(|e| StripeRestError::ParseError(e.to_string()))
    }

    /// Form parameters of a charge.
    fn charge_params(request: &ChargeRequest) -> Vec<(String, String)> {
        let mut params = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.as_str().to_lowercase()),
            ("source".to_string(), request.source_token.clone()),
            ("description".to_string(), request.description.clone()),
            (format!("metadata[{}]", IDEMPOTENCY_METADATA), request.idempotency_key.clone()),
        ];
        if request.application_fee > 0 {
            params.push(("application_fee_amount".to_string(), request.application_fee.to_string()));
        }
        params
    }

    /// Create a charge.
    pub async fn create_charge(&self, request: &ChargeRequest) -> Result<StripeCharge, StripeRestError> {
        debug!(key = %request.idempotency_key, amount = request.amount, "Creating Stripe charge");
        self.send(
            self.client
                .post(self.url("/v1/charges"))
                .header("Idempotency-Key", &request.idempotency_key)
                .form(&Self::charge_params(request)),
        )
        .await
    }

    /// Search a charge by the idempotency key stored in its metadata.
    pub async fn search_charge(&self, idempotency_key: &str) -> Result<Option<StripeCharge>, StripeRestError> {
        let query = format!("metadata['{}']:'{}'", IDEMPOTENCY_METADATA, idempotency_key);
        let list: StripeList<StripeCharge> = self
            .send(self.client.get(self.url("/v1/charges/search")).query(&[("query", query)]))
            .await?;
        Ok(list.data.into_iter().next())
    }

    /// Refund a charge in full.
    pub async fn create_refund(
        &self,
        charge_id: &str,
        idempotency_key: &str,
    ) -> Result<StripeRefund, StripeRestError> {
        self.send(
            self.client
                .post(self.url("/v1/refunds"))
                .header("Idempotency-Key", idempotency_key)
                .form(&[("charge", charge_id)]),
        )
        .await
    }

    /// Fetch a balance transaction.
    pub async fn get_balance_transaction(&self, id: &str) -> Result<StripeBalanceTransaction, StripeRestError> {
        self.send(self.client.get(self.url(&format!("/v1/balance_transactions/{}", id)))).await
    }

    /// Check connectivity and credentials.
    pub async fn ping(&self) -> Result<(), StripeRestError> {
        let _: serde_json::Value = self.send(self.client.get(self.url("/v1/balance"))).await?;
        Ok(())
    }
}

#[async_trait]
impl PaymentProcessor for StripeRestClient {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, ExecError> {
        let charge = self.create_charge(request).await?;
        Ok(charge.into_receipt()?)
    }

    async fn find_charge(&self, idempotency_key: &str) -> Result<Option<ChargeReceipt>, ExecError> {
        match self.search_charge(idempotency_key).await? {
            Some(charge) => Ok(Some(charge.into_receipt()?)),
            None => Ok(None),
        }
    }

    async fn refund(&self, charge_id: &str, idempotency_key: &str) -> Result<RefundReceipt, ExecError> {
        let refund = self.create_refund(charge_id, idempotency_key).await?;
        let settlement_id = refund
            .balance_transaction
            .ok_or(StripeRestError::MissingField("refund.balance_transaction"))?;
        Ok(RefundReceipt {
            refund_id: refund.id,
            charge_id: refund.charge,
            settlement_id,
            amount: refund.amount,
        })
    }

    async fn settlement(&self, settlement_id: &str) -> Result<Settlement, ExecError> {
        let balance = self.get_balance_transaction(settlement_id).await?;
        Ok(balance.into_settlement()?)
    }

    async fn health_check(&self) -> Result<(), ExecError> {
        self.ping().await.map_err(|e| {
            warn!(error = %e, "Stripe health check failed");
            ExecError::from(e)
        })
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// Stripe error response.
#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: Option<String>,
}

/// Paginated list.
#[derive(Debug, Deserialize)]
struct StripeList<T> {
    data: Vec<T>,
}

/// Stripe charge.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeCharge {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    /// Unix timestamp
    pub created: i64,
    /// Settlement record; set once the charge is captured
    pub balance_transaction: Option<String>,
}

impl StripeCharge {
    fn into_receipt(self) -> Result<ChargeReceipt, StripeRestError> {
        let settlement_id =
            self.balance_transaction.ok_or(StripeRestError::MissingField("charge.balance_transaction"))?;
        Ok(ChargeReceipt {
            charge_id: self.id,
            settlement_id,
            amount: self.amount,
            currency: parse_currency(&self.currency)?,
            created_at: parse_timestamp(self.created)?,
        })
    }
}

/// Stripe refund.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeRefund {
    pub id: String,
    pub charge: String,
    pub amount: i64,
    pub balance_transaction: Option<String>,
}

/// Stripe balance transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeBalanceTransaction {
    pub id: String,
    pub amount: Option<i64>,
    pub currency: String,
    #[serde(default)]
    pub fee_details: Vec<StripeFeeDetail>,
}

/// Itemized fee of a balance transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeFeeDetail {
    pub amount: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

impl StripeBalanceTransaction {
    fn into_settlement(self) -> Result<Settlement, StripeRestError> {
        Ok(Settlement {
            currency: parse_currency(&self.currency)?,
            id: self.id,
            amount: self.amount,
            fee_details: self
                .fee_details
                .into_iter()
                .map(|fee| FeeDetail::new(&fee.kind, fee.amount))
                .collect(),
        })
    }
}

fn parse_currency(code: &str) -> Result<Currency, StripeRestError> {
    Currency::new(code).map_err(|e| StripeRestError::ParseError(e.to_string()))
}

fn parse_timestamp(secs: i64) -> Result<DateTime<Utc>, StripeRestError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| StripeRestError::ParseError(format!("invalid timestamp {}", secs)))
}

// =============================================================================
// Tests
// =============================================================================
