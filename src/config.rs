// config.rs
// description: Run configuration loaded once from config.toml with credential overrides from the environment.

// ============================================================================
// IMPORTS
// ============================================================================

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::Path;
use std::time::Duration;

/// Upper bound for any configured delay or backoff, in seconds.
pub const MAX_DELAY_SECS: f64 = 3600.0;
const MAX_MULTIPLIER: f64 = 100.0;

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Clone, Default, Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    pub store: Store,
    pub enrichment: Enrichment,
    pub tables: Tables,
    pub columns: Columns,
    pub worker: Worker,
    pub retry: Retry,
    pub schedule: Schedule,
    pub report: Report,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.store.page_size.value == 0 {
            return Err(anyhow!("Store page size must be positive"));
        }
        if self.store.request_timeout_secs.value == 0 {
            return Err(anyhow!("Store request timeout must be positive"));
        }
        if self.enrichment.request_timeout_secs.value == 0 {
            return Err(anyhow!("Enrichment request timeout must be positive"));
        }
        for (label, name) in [
            ("source", &self.tables.source.value),
            ("excluded", &self.tables.excluded.value),
            ("active", &self.tables.active.value),
            ("allocation", &self.tables.allocation.value),
        ] {
            if name.trim().is_empty() {
                return Err(anyhow!("Table name for {} cannot be empty", label));
            }
        }
        if self.columns.identifier.value.trim().is_empty() {
            return Err(anyhow!("Identifier column cannot be empty"));
        }
        if self.worker.pool_size.value == 0 {
            return Err(anyhow!("Worker pool size must be positive"));
        }
        if self.worker.batch_size.value == 0 {
            return Err(anyhow!("Upsert batch size must be positive"));
        }
        for (label, secs) in [
            ("Rate delay", self.worker.rate_delay_secs.value),
            ("Initial backoff", self.retry.initial_backoff_secs.value),
            ("Max backoff", self.retry.max_backoff_secs.value),
        ] {
            if !(0.0..=MAX_DELAY_SECS).contains(&secs) {
                return Err(anyhow!(
                    "{} must be between 0 and {} seconds, got {}",
                    label,
                    MAX_DELAY_SECS,
                    secs
                ));
            }
        }
        if self.retry.max_attempts.value == 0 {
            return Err(anyhow!("Retry max attempts must be at least 1"));
        }
        if !(1.0..=MAX_MULTIPLIER).contains(&self.retry.multiplier.value) {
            return Err(anyhow!(
                "Backoff multiplier must be between 1.0 and {}",
                MAX_MULTIPLIER
            ));
        }
        if self.retry.max_backoff_secs.value < self.retry.initial_backoff_secs.value {
            return Err(anyhow!("Max backoff must not be below the initial backoff"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter.value) {
            return Err(anyhow!("Retry jitter must be between 0.0 and 1.0"));
        }
        if self.schedule.notify_webhook.value && self.schedule.webhook_url.value.trim().is_empty() {
            return Err(anyhow!("Webhook notification enabled but no webhook URL set"));
        }
        Ok(())
    }

    /// Names of required credentials that are still empty after env overrides.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.store.url.value.trim().is_empty() {
            missing.push("SUPABASE_URL");
        }
        if self.store.key.value.trim().is_empty() {
            missing.push("SUPABASE_SERVICE_ROLE_KEY");
        }
        if self.enrichment.token.value.trim().is_empty() {
            missing.push("SIRIX_TOKEN");
        }
        missing
    }

    /// Environment values win over the file. Empty variables are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(url) = get("SUPABASE_URL") {
            self.store.url.value = url;
        }
        if let Some(key) = get("SUPABASE_SERVICE_ROLE_KEY").or_else(|| get("SUPABASE_ANON_KEY")) {
            self.store.key.value = key;
        }
        if let Some(url) = get("SIRIX_API_URL") {
            self.enrichment.api_url.value = url;
        }
        if let Some(token) = get("SIRIX_TOKEN") {
            self.enrichment.token.value = token;
        }
        if let Some(hook) = get("NETLIFY_BUILD_HOOK_URL") {
            self.schedule.webhook_url.value = hook;
        }
    }
}

#[derive(Clone, Default, Deserialize, Debug)]
pub struct ValueWrapper<T> {
    pub value: T,
    #[serde(default)]
    pub description: String,
}

fn wrap<T>(value: T) -> ValueWrapper<T> {
    ValueWrapper {
        value,
        description: String::new(),
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct Store {
    pub url: ValueWrapper<String>,
    pub key: ValueWrapper<String>,
    pub schema: ValueWrapper<String>,
    pub page_size: ValueWrapper<usize>,
    pub request_timeout_secs: ValueWrapper<u64>,
}

impl Default for Store {
    fn default() -> Self {
        Store {
            url: wrap(String::new()),
            key: wrap(String::new()),
            schema: wrap("public".to_string()),
            page_size: wrap(1000),
            request_timeout_secs: wrap(30),
        }
    }
}

impl Store {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.value)
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct Enrichment {
    pub api_url: ValueWrapper<String>,
    pub token: ValueWrapper<String>,
    pub request_timeout_secs: ValueWrapper<u64>,
}

impl Default for Enrichment {
    fn default() -> Self {
        Enrichment {
            api_url: wrap(
                "https://restapi-real3.sirixtrader.com/api/UserStatus/GetUserTransactions".to_string(),
            ),
            token: wrap(String::new()),
            request_timeout_secs: wrap(25),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct Tables {
    pub source: ValueWrapper<String>,
    pub excluded: ValueWrapper<String>,
    pub active: ValueWrapper<String>,
    pub allocation: ValueWrapper<String>,
}

impl Default for Tables {
    fn default() -> Self {
        Tables {
            source: wrap("lv_tpaccount_skim".to_string()),
            excluded: wrap("e2t_excluded".to_string()),
            active: wrap("e2t_active".to_string()),
            allocation: wrap("e2t_country_allocation".to_string()),
        }
    }
}

/// Column names in the CRM mirror table.
#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct Columns {
    pub identifier: ValueWrapper<String>,
    pub temp_label: ValueWrapper<String>,
    pub display_name: ValueWrapper<String>,
}

impl Default for Columns {
    fn default() -> Self {
        Columns {
            identifier: wrap("lv_name".to_string()),
            temp_label: wrap("lv_tempname".to_string()),
            display_name: wrap("lv_accountidname".to_string()),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct Worker {
    pub pool_size: ValueWrapper<usize>,
    pub batch_size: ValueWrapper<usize>,
    pub rate_delay_secs: ValueWrapper<f64>,
    pub skip_existing: ValueWrapper<bool>,
    pub log_every: ValueWrapper<usize>,
}

impl Default for Worker {
    fn default() -> Self {
        Worker {
            pool_size: wrap(8),
            batch_size: wrap(500),
            rate_delay_secs: wrap(0.2),
            skip_existing: wrap(false),
            log_every: wrap(200),
        }
    }
}

impl Worker {
    /// Pause between dispatches. The configured delay is spread across the pool.
    pub fn dispatch_delay(&self) -> Duration {
        let workers = self.pool_size.value.max(1) as f64;
        secs_to_duration(self.rate_delay_secs.value / workers)
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct Retry {
    pub max_attempts: ValueWrapper<u32>,
    pub initial_backoff_secs: ValueWrapper<f64>,
    pub multiplier: ValueWrapper<f64>,
    pub max_backoff_secs: ValueWrapper<f64>,
    pub jitter: ValueWrapper<f64>,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            max_attempts: wrap(6),
            initial_backoff_secs: wrap(0.5),
            multiplier: wrap(2.0),
            max_backoff_secs: wrap(10.0),
            jitter: wrap(0.3),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct Schedule {
    pub timezone_label: ValueWrapper<String>,
    pub run_on_startup: ValueWrapper<bool>,
    pub notify_webhook: ValueWrapper<bool>,
    pub webhook_url: ValueWrapper<String>,
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule {
            timezone_label: wrap("Europe/London".to_string()),
            run_on_startup: wrap(true),
            notify_webhook: wrap(false),
            webhook_url: wrap(String::new()),
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct Report {
    pub report_dir: ValueWrapper<String>,
    pub log_dir: ValueWrapper<String>,
    pub export_csv: ValueWrapper<bool>,
}

impl Default for Report {
    fn default() -> Self {
        Report {
            report_dir: wrap("report".to_string()),
            log_dir: wrap("log".to_string()),
            export_csv: wrap(true),
        }
    }
}

/// Seconds to a `Duration`, clamped to `0..=MAX_DELAY_SECS`. NaN becomes zero.
pub fn secs_to_duration(secs: f64) -> Duration {
    let clamped = if secs.is_nan() { 0.0 } else { secs.clamp(0.0, MAX_DELAY_SECS) };
    Duration::try_from_secs_f64(clamped).unwrap_or(Duration::ZERO)
}

// ============================================================================
// LOADING
// ============================================================================

pub fn parse_config(toml_str: &str) -> Result<Config> {
    let config: Config = toml::from_str(toml_str).context("Failed to parse config TOML")?;
    Ok(config)
}

/// Reads the TOML file if it exists, then layers environment credentials on top.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let toml_str = read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_config(&toml_str)?
    } else {
        Config::default()
    };
    config.apply_env_overrides(|name| std::env::var(name).ok());
    config
        .validate()
        .map_err(|e| anyhow!("Config validation failed: {}", e))?;
    Ok(config)
}
