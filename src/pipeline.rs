// pipeline.rs
// Description: One reconciliation run. Load CRM mirror, classify, write excluded rows, enrich eligible
// accounts, write active rows, then rebuild country allocation totals.

// ============================================================================
// IMPORTS
// ============================================================================

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::aggregate::{export_if_enabled, recompute_country_totals, AggregateReport};
use crate::classify::classify;
use crate::config::Config;
use crate::enrich::{run_enrichment, EnrichSettings, EnrichmentReport};
use crate::records::{AccountId, ExcludedRecord, SourceRecord};
use crate::sirix::{normalize_account_id, SirixClient};
use crate::store::{Select, StoreClient, StoreError};
use crate::utils::{get_current_time, report_log, report_path};

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum RunError {
    #[error("missing required configuration: {}", .0.join(", "))]
    MissingConfig(Vec<&'static str>),
    #[error("failed to read source table: {0}")]
    SourceRead(#[source] StoreError),
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub source_rows: usize,
    pub excluded: usize,
    pub excluded_written: usize,
    pub excluded_failed: usize,
    pub eligible: usize,
    pub dropped: usize,
    pub queued: usize,
    pub skipped_existing: usize,
    pub enrichment: EnrichmentReport,
    pub active_written: usize,
    pub active_failed: usize,
    pub active_rows_before: Option<u64>,
    pub active_rows_after: Option<u64>,
    pub aggregate: Option<AggregateReport>,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn render(&self) -> String {
        let mut lines = vec![
            "===== RUN SUMMARY =====".to_string(),
            format!("Source rows          : {}", self.source_rows),
            format!(
                "Excluded             : {} (written {}, failed {})",
                self.excluded, self.excluded_written, self.excluded_failed
            ),
            format!("Eligible             : {}", self.eligible),
            format!("Dropped (no name)    : {}", self.dropped),
            format!(
                "Queued for lookup    : {} (skipped existing {})",
                self.queued, self.skipped_existing
            ),
            format!(
                "Lookups              : {} with plan, {} null plan, {} failed",
                self.enrichment.with_plan, self.enrichment.null_plan, self.enrichment.failed
            ),
            format!(
                "Active upserts       : {} written, {} failed",
                self.active_written, self.active_failed
            ),
        ];
        if let (Some(before), Some(after)) = (self.active_rows_before, self.active_rows_after) {
            lines.push(format!(
                "Active rows          : {} -> {} ({:+})",
                before,
                after,
                after as i64 - before as i64
            ));
        }
        match &self.aggregate {
            Some(agg) => lines.push(format!(
                "Countries            : {} ({} upserted, {} stale removed, {} write failures)",
                agg.countries,
                agg.upserted,
                agg.stale_deleted,
                agg.upsert_failed + agg.delete_failed
            )),
            None => lines.push("Countries            : not recomputed".to_string()),
        }
        lines.push(format!("Duration             : {:.1}s", self.elapsed_secs));
        lines.join("\n")
    }
}

// ============================================================================
// STEPS
// ============================================================================

pub async fn load_source_rows(store: &StoreClient, config: &Config) -> Result<Vec<SourceRecord>, StoreError> {
    let cols = &config.columns;
    let projection = format!(
        "{},{},{}",
        cols.identifier.value, cols.temp_label.value, cols.display_name.value
    );
    let select = Select::columns(&projection).order_by(&cols.identifier.value, false);
    let rows = store
        .select_all(&config.tables.source.value, &select, config.store.page_size.value)
        .await?;
    Ok(rows
        .iter()
        .map(|row| {
            SourceRecord::from_row(
                row,
                &cols.identifier.value,
                &cols.temp_label.value,
                &cols.display_name.value,
            )
        })
        .collect())
}

/// Last occurrence of each account id wins, matching one-by-one upsert order.
pub fn dedupe_excluded(rows: Vec<ExcludedRecord>) -> Vec<ExcludedRecord> {
    let mut position: HashMap<AccountId, usize> = HashMap::new();
    let mut out: Vec<ExcludedRecord> = Vec::new();
    for row in rows {
        match position.get(&row.account_id) {
            Some(&idx) => out[idx] = row,
            None => {
                position.insert(row.account_id.clone(), out.len());
                out.push(row);
            }
        }
    }
    out
}

/// Unique identifiers in first-seen order. Identifiers that do not normalize are kept
/// so the lookup stage counts them as failures.
pub fn dedupe_identifiers(rows: &[SourceRecord], existing: &HashSet<String>) -> (Vec<Value>, usize) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    let mut skipped_existing = 0;
    for row in rows {
        match normalize_account_id(&row.identifier) {
            Some(id) => {
                if existing.contains(&id) {
                    if seen.insert(id) {
                        skipped_existing += 1;
                    }
                    continue;
                }
                if seen.insert(id) {
                    out.push(row.identifier.clone());
                }
            }
            None => out.push(row.identifier.clone()),
        }
    }
    (out, skipped_existing)
}

async fn existing_active_ids(store: &StoreClient, config: &Config) -> HashSet<String> {
    match store
        .select_all(
            &config.tables.active.value,
            &Select::columns("account_id").filter("account_id", "not.is.null"),
            config.store.page_size.value,
        )
        .await
    {
        Ok(rows) => rows
            .iter()
            .filter_map(|row| row.get("account_id").and_then(normalize_account_id))
            .collect(),
        Err(e) => {
            warn!("Could not read existing active ids, enriching everything: {}", e);
            HashSet::new()
        }
    }
}

// ============================================================================
// RUN
// ============================================================================

/// Runs the whole pipeline once. Only missing credentials and an unreadable source table
/// are fatal; every write failure is logged and reflected in the summary counts.
pub async fn run_once(
    config: &Config,
    store: &StoreClient,
    sirix: &SirixClient,
) -> Result<RunSummary, RunError> {
    let started = Instant::now();
    info!(
        "[SERVICE] Starting run (TZ={})",
        config.schedule.timezone_label.value
    );
    let missing = config.missing_credentials();
    if !missing.is_empty() {
        error!("[FATAL] Missing configuration: {}", missing.join(", "));
        return Err(RunError::MissingConfig(missing));
    }

    let mut summary = RunSummary::default();
    let tables = &config.tables;
    let batch_size = config.worker.batch_size.value.max(1);

    // 1) CRM mirror
    let source = load_source_rows(store, config)
        .await
        .map_err(RunError::SourceRead)?;
    summary.source_rows = source.len();
    if source.is_empty() {
        warn!("No rows in {}. Populate this table first.", tables.source.value);
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        return Ok(summary);
    }

    // 2) Classification
    let classified = classify(&source);
    summary.excluded = classified.excluded.len() + classified.unkeyed.len();
    summary.eligible = classified.eligible.len();
    summary.dropped = classified.dropped.len();
    info!(
        "Excluded: {} | To process: {} | Dropped: {}",
        summary.excluded, summary.eligible, summary.dropped
    );

    if !classified.unkeyed.is_empty() {
        warn!(
            "{} excluded row(s) have no identifier and will not be written",
            classified.unkeyed.len()
        );
    }

    let excluded = dedupe_excluded(classified.excluded);
    let written = store
        .upsert_chunked(&tables.excluded.value, &excluded, "account_id", batch_size)
        .await;
    summary.excluded_written = written.written;
    summary.excluded_failed = classified.unkeyed.len() + written.invalid_key + written.failed;

    // 3) Enrichment
    summary.active_rows_before = store.count_rows(&tables.active.value, "account_id").await;
    let existing = if config.worker.skip_existing.value {
        existing_active_ids(store, config).await
    } else {
        HashSet::new()
    };
    let (queue, skipped) = dedupe_identifiers(&classified.eligible, &existing);
    summary.queued = queue.len();
    summary.skipped_existing = skipped;
    if skipped > 0 {
        info!("Skipping {} account(s) already in {}", skipped, tables.active.value);
    }

    let settings = EnrichSettings::from_config(&config.worker);
    summary.enrichment = run_enrichment(sirix, queue, &settings).await;

    let written = store
        .upsert_chunked(&tables.active.value, &summary.enrichment.results, "account_id", batch_size)
        .await;
    summary.active_written = written.written;
    summary.active_failed = written.invalid_key + written.failed;
    info!("[INFO] Active upserts: {}", summary.active_written);
    summary.active_rows_after = store.count_rows(&tables.active.value, "account_id").await;

    // 4) Totals
    match recompute_country_totals(store, config).await {
        Ok(report) => {
            export_if_enabled(&report, config);
            summary.aggregate = Some(report);
            info!("[DONE] Country allocation recomputed.");
        }
        Err(e) => error!("Country allocation not recomputed: {}", e),
    }

    summary.elapsed_secs = started.elapsed().as_secs_f64();
    let rendered = summary.render();
    info!(target: "summary", "{}", rendered);
    let path = report_path(&config.report.report_dir.value, &get_current_time());
    if let Err(e) = report_log(&path, &rendered) {
        warn!("Failed to write run report {}: {}", path.display(), e);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sirix::tests::{sirix_config, sirix_payload};
    use crate::store::tests::fast_retry;
    use rust_decimal::Decimal;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(id: Value, temp: &str, name: &str) -> SourceRecord {
        SourceRecord {
            identifier: id,
            temp_label: temp.to_string(),
            display_name: name.to_string(),
        }
    }

    fn run_config(store: &MockServer, sirix: &MockServer, report_dir: &std::path::Path) -> Config {
        let mut config = sirix_config(&store.uri(), sirix);
        config.worker.rate_delay_secs.value = 0.0;
        config.worker.pool_size.value = 3;
        config.report.report_dir.value = report_dir.display().to_string();
        config.report.export_csv.value = false;
        config
    }

    #[test]
    fn excluded_dedupe_keeps_last() {
        let excluded = |id: &str, reason: &str, temp: &str| ExcludedRecord {
            account_id: AccountId::parse(id).unwrap(),
            reason: reason.to_string(),
            tempname: temp.to_string(),
        };
        let rows = vec![
            excluded("1", "audition", "a"),
            excluded("2", "audition", "b"),
            excluded("1", "free trial", "c"),
        ];
        let out = dedupe_excluded(rows);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].reason, "free trial");
        assert_eq!(out[1].account_id.as_str(), "2");
    }

    #[test]
    fn identifier_dedupe_and_skip_existing() {
        let rows = vec![
            source(json!("42.0"), "", "A"),
            source(json!(42), "", "A again"),
            source(json!("7"), "", "B"),
            source(json!("9"), "", "C"),
            source(json!("9"), "", "C again"),
            source(Value::Null, "", "No id"),
        ];
        let existing = HashSet::from(["9".to_string()]);
        let (queue, skipped) = dedupe_identifiers(&rows, &existing);
        assert_eq!(queue, vec![json!("42.0"), json!("7"), Value::Null]);
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn missing_credentials_abort_before_any_call() {
        let store_server = MockServer::start().await;
        let sirix_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&store_server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(&store_server, &sirix_server, dir.path());
        let store = StoreClient::new(&config).unwrap();
        let sirix = SirixClient::new(&config).unwrap();
        config.enrichment.token.value.clear();

        let err = run_once(&config, &store, &sirix).await.unwrap_err();
        assert!(matches!(err, RunError::MissingConfig(ref m) if m == &vec!["SIRIX_TOKEN"]));
    }

    #[tokio::test]
    async fn unreadable_source_table_is_fatal() {
        let store_server = MockServer::start().await;
        let sirix_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/lv_tpaccount_skim"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&store_server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let config = run_config(&store_server, &sirix_server, dir.path());
        let store = StoreClient::new(&config).unwrap().with_retry_policy(fast_retry());
        let sirix = SirixClient::new(&config).unwrap();

        let err = run_once(&config, &store, &sirix).await.unwrap_err();
        assert!(matches!(err, RunError::SourceRead(StoreError::Rejected { status: 401, .. })));
    }

    /// CRM mirror of five rows: one audition, one blank name, three to look up.
    /// The allocation table still holds a `DE` row from an earlier run.
    async fn mount_store(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/lv_tpaccount_skim"))
            .and(query_param("order", "lv_name.asc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"lv_name": "100", "lv_tempname": "Audition", "lv_accountidname": "A"},
                {"lv_name": "200", "lv_tempname": "Funded", "lv_accountidname": "B"},
                {"lv_name": "300", "lv_tempname": "", "lv_accountidname": "C"},
                {"lv_name": "400", "lv_tempname": "", "lv_accountidname": " "},
                {"lv_name": "500", "lv_tempname": null, "lv_accountidname": "E"}
            ])))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/e2t_excluded"))
            .respond_with(ResponseTemplate::new(201))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/e2t_active"))
            .respond_with(ResponseTemplate::new(201))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/e2t_active"))
            .and(query_param("select", "country,plan"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"country": "US", "plan": 100},
                {"country": "US", "plan": 50},
                {"country": "FR", "plan": 30}
            ])))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/e2t_active"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Range", "0-0/3")
                    .set_body_json(json!([])),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/e2t_country_allocation"))
            .respond_with(ResponseTemplate::new(201))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/e2t_country_allocation"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"country": "US"}, {"country": "DE"}
            ])))
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/e2t_country_allocation"))
            .and(query_param("country", "eq.DE"))
            .respond_with(ResponseTemplate::new(204))
            .mount(server)
            .await;
    }

    /// 200 and 500 resolve with a plan, 300 fails with a 502.
    async fn mount_sirix(server: &MockServer) {
        let ok = |country: &str, amount: i64| {
            ResponseTemplate::new(200).set_body_json(sirix_payload(
                Some(country),
                json!([{"Comment": "Initial balance", "Amount": amount}]),
            ))
        };
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"UserID": "200"})))
            .respond_with(ok("US", 100))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"UserID": "300"})))
            .respond_with(ResponseTemplate::new(502))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"UserID": "500"})))
            .respond_with(ok("FR", 30))
            .mount(server)
            .await;
    }

    /// Every non-GET request the store saw, as (method, path and query, JSON body).
    async fn store_writes(server: &MockServer) -> Vec<(String, String, Value)> {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method.as_str() != "GET")
            .map(|r| {
                let target = match r.url.query() {
                    Some(q) => format!("{}?{}", r.url.path(), q),
                    None => r.url.path().to_string(),
                };
                let body = if r.body.is_empty() {
                    Value::Null
                } else {
                    r.body_json::<Value>().unwrap()
                };
                (r.method.as_str().to_string(), target, body)
            })
            .collect()
    }

    fn lookup_ids(requests: &[wiremock::Request]) -> Vec<String> {
        requests
            .iter()
            .map(|r| r.body_json::<Value>().unwrap()["UserID"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn full_run_writes_every_table() {
        let store_server = MockServer::start().await;
        let sirix_server = MockServer::start().await;
        mount_store(&store_server).await;
        mount_sirix(&sirix_server).await;

        let dir = tempfile::tempdir().unwrap();
        let config = run_config(&store_server, &sirix_server, dir.path());
        let store = StoreClient::new(&config).unwrap().with_retry_policy(fast_retry());
        let sirix = SirixClient::new(&config).unwrap();

        let summary = run_once(&config, &store, &sirix).await.unwrap();
        assert_eq!(summary.source_rows, 5);
        assert_eq!(summary.excluded, 1);
        assert_eq!(summary.excluded_written, 1);
        assert_eq!(summary.eligible, 3);
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.queued, 3);
        assert_eq!(summary.enrichment.with_plan, 2);
        assert_eq!(summary.enrichment.failed, 1);
        assert_eq!(summary.active_written, 2);
        assert_eq!(summary.active_rows_after, Some(3));

        let writes = store_writes(&store_server).await;
        assert_eq!(writes.len(), 4);
        let body_for = |table: &str| {
            writes
                .iter()
                .find(|(m, target, _)| m == "POST" && target.starts_with(table))
                .map(|(_, _, body)| body.clone())
                .unwrap()
        };
        assert_eq!(
            body_for("/rest/v1/e2t_excluded"),
            json!([{"account_id": "100", "reason": "audition", "tempname": "Audition"}])
        );
        // The failed lookup for 300 must not reach the active table.
        let active_ids: HashSet<String> = body_for("/rest/v1/e2t_active")
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["account_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(active_ids, HashSet::from(["200".to_string(), "500".to_string()]));
        assert!(writes
            .iter()
            .any(|(m, target, _)| m == "DELETE" && target.contains("country=eq.DE")));

        let agg = summary.aggregate.as_ref().unwrap();
        assert_eq!(agg.countries, 2);
        assert_eq!(agg.stale_deleted, 1);
        let us = agg.totals.iter().find(|t| t.country == "US").unwrap();
        assert_eq!(us.total_plan, Decimal::from(150));

        let report = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(report, 1);
    }

    #[tokio::test]
    async fn repeated_run_issues_identical_writes() {
        let store_server = MockServer::start().await;
        let sirix_server = MockServer::start().await;
        mount_store(&store_server).await;
        mount_sirix(&sirix_server).await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(&store_server, &sirix_server, dir.path());
        // One worker keeps the active batch in submission order.
        config.worker.pool_size.value = 1;
        let store = StoreClient::new(&config).unwrap().with_retry_policy(fast_retry());
        let sirix = SirixClient::new(&config).unwrap();

        let first = run_once(&config, &store, &sirix).await.unwrap();
        let after_first = store_writes(&store_server).await;
        let second = run_once(&config, &store, &sirix).await.unwrap();
        let after_second = store_writes(&store_server).await;

        assert_eq!(after_second.len(), after_first.len() * 2);
        let (run_one, run_two) = after_second.split_at(after_first.len());
        assert_eq!(run_one, run_two);
        assert_eq!(
            first.aggregate.as_ref().map(|a| a.totals.clone()),
            second.aggregate.as_ref().map(|a| a.totals.clone())
        );
    }

    #[tokio::test]
    async fn skip_existing_leaves_known_accounts_alone() {
        let store_server = MockServer::start().await;
        let sirix_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/e2t_active"))
            .and(query_param("select", "account_id"))
            .and(query_param("account_id", "not.is.null"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"account_id": 200}])))
            .expect(1)
            .mount(&store_server)
            .await;
        mount_store(&store_server).await;
        mount_sirix(&sirix_server).await;

        let dir = tempfile::tempdir().unwrap();
        let mut config = run_config(&store_server, &sirix_server, dir.path());
        config.worker.skip_existing.value = true;
        let store = StoreClient::new(&config).unwrap().with_retry_policy(fast_retry());
        let sirix = SirixClient::new(&config).unwrap();

        let summary = run_once(&config, &store, &sirix).await.unwrap();
        assert_eq!(summary.skipped_existing, 1);
        assert_eq!(summary.queued, 2);
        assert_eq!(summary.enrichment.with_plan, 1);
        assert_eq!(summary.enrichment.failed, 1);

        let mut looked_up = lookup_ids(&sirix_server.received_requests().await.unwrap());
        looked_up.sort();
        assert_eq!(looked_up, vec!["300".to_string(), "500".to_string()]);
    }

    #[tokio::test]
    async fn empty_source_table_ends_run_quietly() {
        let store_server = MockServer::start().await;
        let sirix_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/lv_tpaccount_skim"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&store_server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&store_server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = run_config(&store_server, &sirix_server, dir.path());
        let store = StoreClient::new(&config).unwrap();
        let sirix = SirixClient::new(&config).unwrap();
        let summary = run_once(&config, &store, &sirix).await.unwrap();
        assert_eq!(summary.source_rows, 0);
        assert!(summary.aggregate.is_none());
    }
}
