// enrich.rs
// Description: Fans account lookups out over a bounded worker pool and collects results as they finish.

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::config::Worker;
use crate::records::ActiveRecord;
use crate::sirix::{EnrichError, SirixClient};

#[derive(Clone, Debug)]
pub struct EnrichSettings {
    pub pool_size: usize,
    pub dispatch_delay: Duration,
    pub log_every: usize,
}

impl EnrichSettings {
    pub fn from_config(worker: &Worker) -> Self {
        EnrichSettings {
            pool_size: worker.pool_size.value.max(1),
            dispatch_delay: worker.dispatch_delay(),
            log_every: worker.log_every.value,
        }
    }
}

#[derive(Debug, Default)]
pub struct EnrichmentReport {
    /// Successful lookups, in completion order.
    pub results: Vec<ActiveRecord>,
    pub with_plan: usize,
    pub null_plan: usize,
    pub failed: usize,
    pub no_identifier: usize,
}

impl EnrichmentReport {
    pub fn attempted(&self) -> usize {
        self.with_plan + self.null_plan + self.failed
    }

    fn record(&mut self, outcome: Result<ActiveRecord, EnrichError>) {
        match outcome {
            Ok(record) => {
                if record.plan.is_some() {
                    self.with_plan += 1;
                } else {
                    self.null_plan += 1;
                }
                self.results.push(record);
            }
            Err(EnrichError::NoIdentifier) => {
                self.no_identifier += 1;
                self.failed += 1;
            }
            Err(_) => self.failed += 1,
        }
    }
}

/// Looks up every identifier with at most `pool_size` calls in flight.
/// Each lookup is isolated: errors and panics count as failures and never stop the batch.
pub async fn run_enrichment(
    client: &SirixClient,
    identifiers: Vec<Value>,
    settings: &EnrichSettings,
) -> EnrichmentReport {
    let total = identifiers.len();
    let semaphore = Arc::new(Semaphore::new(settings.pool_size.max(1)));
    let mut in_flight = FuturesUnordered::new();
    let mut report = EnrichmentReport::default();

    info!(
        "Enrichment: {} account(s) across {} worker(s)",
        total, settings.pool_size
    );

    for raw_id in identifiers {
        // Backpressure: wait for a free worker before dispatching, draining finished work meanwhile.
        let permit = loop {
            tokio::select! {
                permit = semaphore.clone().acquire_owned() => break permit,
                Some(joined) = in_flight.next(), if !in_flight.is_empty() => {
                    collect(&mut report, joined, total, settings.log_every);
                }
            }
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
                error!("Enrichment worker pool closed: {}", e);
                break;
            }
        };

        let client = client.clone();
        in_flight.push(tokio::spawn(async move {
            let outcome = client.fetch_country_and_plan(&raw_id).await;
            drop(permit);
            outcome
        }));

        if !settings.dispatch_delay.is_zero() {
            tokio::time::sleep(settings.dispatch_delay).await;
        }
    }

    while let Some(joined) = in_flight.next().await {
        collect(&mut report, joined, total, settings.log_every);
    }

    info!(
        "Enrichment done: {} ok with plan, {} ok without plan, {} failed ({} without identifier)",
        report.with_plan, report.null_plan, report.failed, report.no_identifier
    );
    report
}

fn collect(
    report: &mut EnrichmentReport,
    joined: Result<Result<ActiveRecord, EnrichError>, tokio::task::JoinError>,
    total: usize,
    log_every: usize,
) {
    match joined {
        Ok(outcome) => report.record(outcome),
        Err(e) => {
            error!("Enrichment task aborted: {}", e);
            report.failed += 1;
        }
    }
    let done = report.attempted();
    if log_every > 0 && done % log_every == 0 {
        info!(
            "Enrichment progress: {}/{} | plan={} null={} failed={}",
            done, total, report.with_plan, report.null_plan, report.failed
        );
    }
}
