// store.rs
// Description: REST client for the row store (PostgREST dialect). Paginated reads, conflict-resolving
// batch upserts and filtered deletes, all behind one retry/backoff policy.

// ============================================================================
// IMPORTS
// ============================================================================

use anyhow::{anyhow, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_RANGE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::Config;
use crate::records::{ActiveRecord, CountryAllocation, ExcludedRecord};
use crate::retry::{is_transient_message, is_transient_status, truncate, RetryPolicy};

pub type Row = Map<String, Value>;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient failure after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },
    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to decode store response: {0}")]
    Decode(String),
    #[error("refusing to delete without a filter")]
    UnscopedDelete,
    #[error("conflict key is empty")]
    InvalidKey,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient { .. } => true,
            StoreError::Rejected { status, body } => {
                is_transient_status(*status) || is_transient_message(body)
            }
            StoreError::Transport(message) => is_transient_message(message),
            _ => false,
        }
    }

    fn after_attempts(self, attempts: u32) -> Self {
        if !self.is_transient() {
            return self;
        }
        let message = match self {
            StoreError::Transient { message, .. } => message,
            other => other.to_string(),
        };
        StoreError::Transient { attempts, message }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            StoreError::Transient {
                attempts: 1,
                message: e.to_string(),
            }
        } else if e.is_decode() {
            StoreError::Decode(e.to_string())
        } else {
            StoreError::Transport(e.to_string())
        }
    }
}

// ============================================================================
// QUERY AND WRITE TYPES
// ============================================================================

/// Column projection, filters and ordering for a read.
#[derive(Clone, Debug, Default)]
pub struct Select {
    pub columns: String,
    pub filters: Vec<(String, String)>,
    pub order: Option<String>,
}

impl Select {
    pub fn columns(columns: &str) -> Self {
        Select {
            columns: columns.to_string(),
            ..Default::default()
        }
    }

    /// `expr` is a PostgREST operator expression such as `eq.US`.
    pub fn filter(mut self, column: &str, expr: &str) -> Self {
        self.filters.push((column.to_string(), expr.to_string()));
        self
    }

    pub fn order_by(mut self, column: &str, desc: bool) -> Self {
        let dir = if desc { "desc" } else { "asc" };
        self.order = Some(format!("{}.{}", column, dir));
        self
    }
}

/// A row that can be written with an upsert. The conflict value must be non-empty.
pub trait UpsertRow: Serialize {
    fn conflict_value(&self) -> &str;
}

impl UpsertRow for ExcludedRecord {
    fn conflict_value(&self) -> &str {
        self.account_id.as_str()
    }
}

impl UpsertRow for ActiveRecord {
    fn conflict_value(&self) -> &str {
        self.account_id.as_str()
    }
}

impl UpsertRow for CountryAllocation {
    fn conflict_value(&self) -> &str {
        &self.country
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub written: usize,
    pub invalid_key: usize,
    pub failed: usize,
}

impl WriteReport {
    fn absorb(&mut self, other: WriteReport) {
        self.written += other.written;
        self.invalid_key += other.invalid_key;
        self.failed += other.failed;
    }
}

// ============================================================================
// CLIENT
// ============================================================================

#[derive(Clone)]
pub struct StoreClient {
    base_url: Url,
    client: Client,
    headers: HeaderMap,
    retry: RetryPolicy,
}

impl StoreClient {
    pub fn new(config: &Config) -> Result<Self> {
        let store = &config.store;
        let root = store.url.value.trim().trim_end_matches('/');
        if root.is_empty() {
            return Err(anyhow!("Store URL cannot be empty"));
        }
        let base_url = Url::parse(&format!("{}/rest/v1/", root))
            .map_err(|e| anyhow!("Invalid store URL '{}': {}", root, e))?;

        let key = store.key.value.trim();
        let schema = store.schema.value.trim();
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(key)?);
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", key))?,
        );
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.insert("Accept-Profile", HeaderValue::from_str(schema)?);
        headers.insert("Content-Profile", HeaderValue::from_str(schema)?);

        let client = Client::builder()
            .timeout(store.request_timeout())
            .build()
            .map_err(|e| anyhow!("Failed to build store HTTP client: {}", e))?;

        let retry = RetryPolicy::from_config(&config.retry);
        info!(
            "Store client initialized for {} ({} attempts, longest backoff {:.1}s)",
            base_url,
            retry.max_attempts,
            retry.max_single_delay().as_secs_f64()
        );
        Ok(StoreClient {
            base_url,
            client,
            headers,
            retry,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn table_url(&self, table: &str) -> Result<Url, StoreError> {
        self.base_url
            .join(table)
            .map_err(|e| StoreError::Transport(format!("bad table name {}: {}", table, e)))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .headers(self.headers.clone())
    }

    /// Runs `func` until it succeeds, fails permanently, or attempts run out.
    async fn call_with_retry<T, F, Fut>(&self, log_prefix: &str, func: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match func().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!("{}: succeeded on attempt {}", log_prefix, attempt);
                    }
                    return Ok(result);
                }
                Err(e) if e.is_transient() && self.retry.has_attempts_left(attempt) => {
                    let delay = self.retry.delay_with_jitter(attempt, &mut rand::thread_rng());
                    warn!(
                        "{}: attempt {}/{} failed: {}. Retrying in {:.2}s",
                        log_prefix,
                        attempt,
                        self.retry.max_attempts,
                        truncate(&e.to_string(), 200),
                        delay.as_secs_f64()
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.after_attempts(attempt)),
            }
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// One page of rows. A 406 (no acceptable representation) is an empty page.
    pub async fn select_page(
        &self,
        table: &str,
        select: &Select,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Row>, StoreError> {
        let url = self.table_url(table)?;
        let mut params: Vec<(String, String)> = vec![("select".to_string(), select.columns.clone())];
        params.extend(select.filters.iter().cloned());
        if let Some(order) = &select.order {
            params.push(("order".to_string(), order.clone()));
        }
        params.push(("limit".to_string(), limit.to_string()));
        params.push(("offset".to_string(), offset.to_string()));

        let log_prefix = format!("select {}", table);
        let result = self
            .call_with_retry(&log_prefix, || async {
                let response = self
                    .request(Method::GET, url.clone())
                    .query(&params)
                    .send()
                    .await?;
                let status = response.status();
                if status == StatusCode::NOT_ACCEPTABLE {
                    return Ok(Vec::new());
                }
                let body = response.text().await?;
                if !status.is_success() {
                    return Err(StoreError::Rejected {
                        status: status.as_u16(),
                        body,
                    });
                }
                if body.trim().is_empty() {
                    return Ok(Vec::new());
                }
                let rows: Vec<Row> = serde_json::from_str(&body)
                    .map_err(|e| StoreError::Decode(format!("{}: {}", e, truncate(&body, 200))))?;
                Ok(rows)
            })
            .await;

        if let Err(e) = &result {
            error!("{}: {}", log_prefix, truncate(&e.to_string(), 200));
        }
        result
    }

    /// Pages through the table until a short page. Failures propagate.
    pub async fn select_all(
        &self,
        table: &str,
        select: &Select,
        page_size: usize,
    ) -> Result<Vec<Row>, StoreError> {
        let page_size = page_size.max(1);
        let mut out = Vec::new();
        let mut offset = 0;
        loop {
            let chunk = self.select_page(table, select, page_size, offset).await?;
            let fetched = chunk.len();
            out.extend(chunk);
            if fetched < page_size {
                break;
            }
            offset += page_size;
        }
        debug!("select_all {}: {} rows", table, out.len());
        Ok(out)
    }

    /// Exact row count via `Content-Range`. `None` when the store does not report one.
    pub async fn count_rows(&self, table: &str, column: &str) -> Option<u64> {
        let url = self.table_url(table).ok()?;
        let response = self
            .request(Method::GET, url)
            .query(&[("select", column)])
            .header("Prefer", "count=exact")
            .header("Range", "0-0")
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let range = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
        parse_content_range_total(range)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    pub async fn upsert_one<T: UpsertRow>(
        &self,
        table: &str,
        row: &T,
        conflict_key: &str,
    ) -> Result<WriteReport, StoreError> {
        self.upsert_batch(table, std::slice::from_ref(row), conflict_key).await
    }

    /// Insert-or-merge all rows in one request, keyed by `conflict_key`.
    /// Rows with an empty conflict value are skipped and counted, never sent.
    pub async fn upsert_batch<T: UpsertRow>(
        &self,
        table: &str,
        rows: &[T],
        conflict_key: &str,
    ) -> Result<WriteReport, StoreError> {
        let valid: Vec<&T> = rows
            .iter()
            .filter(|row| !row.conflict_value().trim().is_empty())
            .collect();
        let invalid_key = rows.len() - valid.len();
        if invalid_key > 0 {
            warn!(
                "upsert {}: skipping {} row(s) with empty {}",
                table, invalid_key, conflict_key
            );
        }
        if valid.is_empty() {
            return Ok(WriteReport {
                invalid_key,
                ..Default::default()
            });
        }

        let payload = serde_json::to_value(&valid).map_err(|e| StoreError::Decode(e.to_string()))?;
        let url = self.table_url(table)?;
        let log_prefix = format!("upsert {}", table);
        let result = self
            .call_with_retry(&log_prefix, || async {
                let response = self
                    .request(Method::POST, url.clone())
                    .query(&[("on_conflict", conflict_key)])
                    .header("Prefer", "resolution=merge-duplicates,return=minimal")
                    .json(&payload)
                    .send()
                    .await?;
                let status = response.status();
                if matches!(status.as_u16(), 200 | 201 | 204) {
                    return Ok(());
                }
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::Rejected {
                    status: status.as_u16(),
                    body,
                })
            })
            .await;

        match result {
            Ok(()) => Ok(WriteReport {
                written: valid.len(),
                invalid_key,
                failed: 0,
            }),
            Err(e) => {
                error!(
                    "{}: {} | rows={}",
                    log_prefix,
                    truncate(&e.to_string(), 200),
                    truncate(&payload.to_string(), 160)
                );
                Err(e)
            }
        }
    }

    /// Writes rows in `batch_size` chunks. A chunk the store rejects outright is retried
    /// row by row so one bad row does not sink its neighbours. Never fails; see the report.
    pub async fn upsert_chunked<T: UpsertRow>(
        &self,
        table: &str,
        rows: &[T],
        conflict_key: &str,
        batch_size: usize,
    ) -> WriteReport {
        let mut report = WriteReport::default();
        for chunk in rows.chunks(batch_size.max(1)) {
            match self.upsert_batch(table, chunk, conflict_key).await {
                Ok(written) => report.absorb(written),
                Err(StoreError::Rejected { status, .. }) if chunk.len() > 1 => {
                    warn!(
                        "upsert {}: batch of {} rejected ({}), retrying row by row",
                        table,
                        chunk.len(),
                        status
                    );
                    for row in chunk {
                        match self.upsert_one(table, row, conflict_key).await {
                            Ok(written) => report.absorb(written),
                            Err(_) => report.failed += 1,
                        }
                    }
                }
                Err(_) => report.failed += chunk.len(),
            }
        }
        report
    }

    /// Deletes rows matching every filter. An empty filter list is refused.
    pub async fn delete(&self, table: &str, filters: &[(String, String)]) -> Result<(), StoreError> {
        if filters.is_empty() {
            error!("delete {}: refusing unfiltered delete", table);
            return Err(StoreError::UnscopedDelete);
        }
        let url = self.table_url(table)?;
        let log_prefix = format!("delete {}", table);
        let result = self
            .call_with_retry(&log_prefix, || async {
                let response = self
                    .request(Method::DELETE, url.clone())
                    .query(filters)
                    .send()
                    .await?;
                let status = response.status();
                if matches!(status.as_u16(), 200 | 204) {
                    return Ok(());
                }
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::Rejected {
                    status: status.as_u16(),
                    body,
                })
            })
            .await;

        if let Err(e) = &result {
            error!(
                "{}: {} | filters={:?}",
                log_prefix,
                truncate(&e.to_string(), 200),
                filters
            );
        }
        result
    }
}

fn parse_content_range_total(range: &str) -> Option<u64> {
    let (_, total) = range.rsplit_once('/')?;
    total.trim().parse().ok()
}
