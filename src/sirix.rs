// sirix.rs
// Description: Trading-platform lookup of an account's country and initial-deposit plan.

// ============================================================================
// IMPORTS
// ============================================================================

use anyhow::{anyhow, Result};
use reqwest::{Client, Url};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::records::{value_to_decimal, AccountId, ActiveRecord};
use crate::retry::truncate;

const INITIAL_BALANCE_PREFIX: &str = "initial balance";

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("no usable account identifier")]
    NoIdentifier,
    #[error("lookup returned status {0}")]
    Status(u16),
    #[error("lookup request failed: {0}")]
    Transport(String),
    #[error("malformed lookup payload: {0}")]
    Payload(String),
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TransactionsRequest<'a> {
    #[serde(rename = "UserID")]
    user_id: &'a str,
    get_open_positions: bool,
    get_pending_positions: bool,
    get_close_positions: bool,
    get_monetary_transactions: bool,
}

#[derive(Clone)]
pub struct SirixClient {
    api_url: Url,
    token: String,
    client: Client,
}

// ============================================================================
// IDENTIFIER NORMALIZATION
// ============================================================================

/// Canonical text form of an account identifier, or `None` when there is nothing to look up.
/// Integer-valued numbers lose any fractional suffix (`42.0` -> `"42"`).
pub fn normalize_account_id(raw: &Value) -> Option<String> {
    let text = match raw {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    if text.is_empty() || text.eq_ignore_ascii_case("nan") {
        return None;
    }
    if let Ok(n) = text.parse::<i64>() {
        return Some(n.to_string());
    }
    match text.parse::<f64>() {
        Ok(f) if f.is_finite() && f.abs() < i64::MAX as f64 => Some((f.trunc() as i64).to_string()),
        _ => Some(text),
    }
}

// ============================================================================
// PAYLOAD EXTRACTION
// ============================================================================

pub fn extract_country(payload: &Value) -> Option<String> {
    payload
        .get("UserData")
        .and_then(|d| d.get("UserDetails"))
        .and_then(|d| d.get("Country"))
        .and_then(|c| c.as_str())
        .map(|c| c.to_string())
}

/// Amount of the first transaction whose comment starts with "initial balance".
/// A non-numeric amount yields `None` rather than an error.
pub fn extract_plan(payload: &Value) -> Option<Decimal> {
    let transactions = payload.get("MonetaryTransactions")?.as_array()?;
    let first = transactions.iter().find(|t| {
        t.get("Comment")
            .and_then(|c| c.as_str())
            .map(|c| c.to_lowercase().starts_with(INITIAL_BALANCE_PREFIX))
            .unwrap_or(false)
    })?;
    value_to_decimal(first.get("Amount"))
}

// ============================================================================
// CLIENT
// ============================================================================

impl SirixClient {
    pub fn new(config: &Config) -> Result<Self> {
        let enrichment = &config.enrichment;
        let api_url = Url::parse(enrichment.api_url.value.trim())
            .map_err(|e| anyhow!("Invalid enrichment API URL: {}", e))?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(enrichment.request_timeout_secs.value))
            .build()
            .map_err(|e| anyhow!("Failed to build enrichment HTTP client: {}", e))?;
        Ok(SirixClient {
            api_url,
            token: enrichment
                .token
                .value
                .trim()
                .trim_matches('"')
                .trim_matches('\'')
                .to_string(),
            client,
        })
    }

    /// One lookup per account. Every failure is returned, never panicked or retried,
    /// so a bad account cannot take sibling lookups down with it.
    pub async fn fetch_country_and_plan(&self, raw_id: &Value) -> Result<ActiveRecord, EnrichError> {
        let uid = normalize_account_id(raw_id).ok_or(EnrichError::NoIdentifier)?;
        let account_id = AccountId::parse(&uid).map_err(|_| EnrichError::NoIdentifier)?;

        let request = TransactionsRequest {
            user_id: account_id.as_str(),
            get_open_positions: false,
            get_pending_positions: false,
            get_close_positions: false,
            get_monetary_transactions: true,
        };
        let response = self
            .client
            .post(self.api_url.clone())
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!("[SIRIX] request failed for {}: {}", account_id, e);
                EnrichError::Transport(e.to_string())
            })?;

        let status = response.status();
        if status.as_u16() != 200 {
            warn!("[SIRIX] {} for {}", status.as_u16(), account_id);
            return Err(EnrichError::Status(status.as_u16()));
        }
        let text = response
            .text()
            .await
            .map_err(|e| EnrichError::Transport(e.to_string()))?;
        if text.trim().is_empty() {
            warn!("[SIRIX] empty payload for {}", account_id);
            return Err(EnrichError::Payload("empty body".to_string()));
        }
        let payload: Value = serde_json::from_str(&text).map_err(|e| {
            warn!("[SIRIX] bad payload for {}: {}", account_id, truncate(&text, 120));
            EnrichError::Payload(e.to_string())
        })?;
        // Only an object carries user data. Anything else is a failed lookup.
        if !payload.is_object() {
            warn!("[SIRIX] non-object payload for {}: {}", account_id, truncate(&text, 120));
            return Err(EnrichError::Payload("expected a JSON object".to_string()));
        }

        let country = extract_country(&payload);
        let plan = extract_plan(&payload);
        debug!("[SIRIX] {} -> country={:?} plan={:?}", account_id, country, plan);
        Ok(ActiveRecord {
            account_id,
            country,
            plan,
        })
    }
}
