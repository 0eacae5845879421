// records.rs
// description: Row types for the CRM mirror, excluded, active and country allocation tables.

use rust_decimal::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

use crate::store::StoreError;

/// Country used for active rows that carry no country.
pub const UNKNOWN_COUNTRY: &str = "Unknown";

// ============================================================================
// CONFLICT KEY
// ============================================================================

/// Upsert conflict key. Never empty after trimming.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StoreError::InvalidKey);
        }
        Ok(AccountId(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// ROWS
// ============================================================================

/// A row of the CRM mirror table, read-only to the pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceRecord {
    pub identifier: Value,
    pub temp_label: String,
    pub display_name: String,
}

impl SourceRecord {
    /// Builds a record from a raw store row using the configured column names.
    /// Missing or null text columns become empty strings.
    pub fn from_row(
        row: &Map<String, Value>,
        identifier_col: &str,
        temp_label_col: &str,
        display_name_col: &str,
    ) -> Self {
        SourceRecord {
            identifier: row.get(identifier_col).cloned().unwrap_or(Value::Null),
            temp_label: value_to_text(row.get(temp_label_col)),
            display_name: value_to_text(row.get(display_name_col)),
        }
    }

    pub fn identifier_text(&self) -> String {
        value_to_text(Some(&self.identifier)).trim().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExcludedRecord {
    pub account_id: AccountId,
    pub reason: String,
    pub tempname: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActiveRecord {
    pub account_id: AccountId,
    pub country: Option<String>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub plan: Option<Decimal>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CountryAllocation {
    pub country: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_plan: Decimal,
}

/// Country and plan columns as read back from the active table.
#[derive(Clone, Debug, Default)]
pub struct ActiveSnapshot {
    pub country: Option<Value>,
    pub plan: Option<Value>,
}

// ============================================================================
// VALUE HELPERS
// ============================================================================

pub fn value_to_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Lenient numeric read. Strings are trimmed, anything unparsable is `None`.
pub fn value_to_decimal(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) => parse_decimal(s.trim()),
        _ => None,
    }
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    if text.is_empty() {
        return None;
    }
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

/// Blank or whitespace-only country collapses to [`UNKNOWN_COUNTRY`].
pub fn normalize_country(value: Option<&Value>) -> String {
    let text = value_to_text(value);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        UNKNOWN_COUNTRY.to_string()
    } else {
        trimmed.to_string()
    }
}
