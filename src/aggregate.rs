// aggregate.rs
// description: Recomputes per-country plan totals from the active table and reconciles the allocation table.

use anyhow::{Context, Result};
use csv::Writer;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::records::{normalize_country, value_to_decimal, ActiveSnapshot, CountryAllocation};
use crate::store::{Select, StoreClient, StoreError};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct AggregateReport {
    pub countries: usize,
    pub upserted: usize,
    pub upsert_failed: usize,
    pub stale_deleted: usize,
    pub delete_failed: usize,
    pub totals: Vec<CountryAllocation>,
}

/// Sums plan per country. Missing or non-numeric plan counts as zero.
pub fn compute_country_totals(rows: &[ActiveSnapshot]) -> BTreeMap<String, Decimal> {
    let mut buckets: BTreeMap<String, Decimal> = BTreeMap::new();
    for row in rows {
        let country = normalize_country(row.country.as_ref());
        let plan = value_to_decimal(row.plan.as_ref()).unwrap_or(Decimal::ZERO);
        *buckets.entry(country).or_insert(Decimal::ZERO) += plan;
    }
    buckets
}

/// Countries present in the allocation table but not in the new totals.
pub fn stale_countries(existing: &[String], fresh: &BTreeMap<String, Decimal>) -> BTreeSet<String> {
    existing
        .iter()
        .filter(|c| !fresh.contains_key(c.as_str()))
        .cloned()
        .collect()
}

/// Full recompute: read active rows, upsert every country total, then delete vanished countries.
/// Reads fail the step; individual writes are logged and counted.
pub async fn recompute_country_totals(
    store: &StoreClient,
    config: &Config,
) -> Result<AggregateReport, StoreError> {
    let page_size = config.store.page_size.value;
    let active_table = &config.tables.active.value;
    let alloc_table = &config.tables.allocation.value;

    let rows = store
        .select_all(active_table, &Select::columns("country,plan"), page_size)
        .await?;
    let snapshots: Vec<ActiveSnapshot> = rows
        .into_iter()
        .map(|row| ActiveSnapshot {
            country: row.get("country").cloned(),
            plan: row.get("plan").cloned(),
        })
        .collect();
    let totals = compute_country_totals(&snapshots);

    let mut report = AggregateReport {
        countries: totals.len(),
        totals: totals
            .iter()
            .map(|(country, total)| CountryAllocation {
                country: country.clone(),
                total_plan: *total,
            })
            .collect(),
        ..Default::default()
    };

    let written = store
        .upsert_chunked(alloc_table, &report.totals, "country", config.worker.batch_size.value)
        .await;
    report.upserted = written.written;
    report.upsert_failed = written.invalid_key + written.failed;

    let existing: Vec<String> = store
        .select_all(alloc_table, &Select::columns("country"), page_size)
        .await?
        .iter()
        .map(|row| normalize_country(row.get("country")))
        .collect();
    for country in stale_countries(&existing, &totals) {
        let filter = [("country".to_string(), format!("eq.{}", country))];
        match store.delete(alloc_table, &filter).await {
            Ok(()) => {
                info!("Removed stale country allocation: {}", country);
                report.stale_deleted += 1;
            }
            Err(_) => report.delete_failed += 1,
        }
    }

    info!(
        "Country allocation: {} countries, {} upserted, {} stale removed",
        report.countries, report.upserted, report.stale_deleted
    );
    if report.upsert_failed > 0 || report.delete_failed > 0 {
        warn!(
            "Country allocation incomplete: {} upsert failure(s), {} delete failure(s)",
            report.upsert_failed, report.delete_failed
        );
    }
    Ok(report)
}

#[derive(Serialize)]
struct AllocationCsvRow<'a> {
    country: &'a str,
    total_plan: String,
}

/// Writes totals sorted by descending total to `<dir>/country_allocation.csv`.
pub fn export_allocation_to_csv(totals: &[CountryAllocation], dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join("country_allocation.csv");
    let mut sorted: Vec<&CountryAllocation> = totals.iter().collect();
    sorted.sort_by(|a, b| b.total_plan.cmp(&a.total_plan).then_with(|| a.country.cmp(&b.country)));

    let mut writer = Writer::from_path(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    for row in sorted {
        writer.serialize(AllocationCsvRow {
            country: &row.country,
            total_plan: row.total_plan.normalize().to_string(),
        })?;
    }
    writer.flush()?;
    info!("Exported {} country totals to {}", totals.len(), path.display());
    Ok(())
}

pub fn export_if_enabled(report: &AggregateReport, config: &Config) {
    if !config.report.export_csv.value {
        return;
    }
    let dir = Path::new(&config.report.report_dir.value);
    if let Err(e) = export_allocation_to_csv(&report.totals, dir) {
        error!("Failed to export country allocation CSV: {}", e);
    }
}
