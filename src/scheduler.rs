// scheduler.rs
// description: Boot run, then one run per local midnight. Optionally pings a build webhook after each success.

use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::pipeline::run_once;
use crate::sirix::SirixClient;
use crate::store::StoreClient;
use crate::utils::{format_hms, next_local_midnight, sleep_duration_until};

const MIN_SLEEP: Duration = Duration::from_secs(5);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// IANA zone for the daily run, or `None` when the label does not name one.
pub fn schedule_zone(label: &str) -> Option<Tz> {
    label.trim().parse::<Tz>().ok()
}

/// Next midnight in `zone` (host local time when `None`) as an RFC 3339 string,
/// and how long to sleep until then.
pub fn next_run(zone: Option<Tz>, now: DateTime<Utc>) -> (String, Duration) {
    match zone {
        Some(tz) => {
            let now = now.with_timezone(&tz);
            let target = next_local_midnight(&now);
            (target.to_rfc3339(), sleep_duration_until(&now, &target, MIN_SLEEP))
        }
        None => {
            let now = now.with_timezone(&Local);
            let target = next_local_midnight(&now);
            (target.to_rfc3339(), sleep_duration_until(&now, &target, MIN_SLEEP))
        }
    }
}

/// Fires the build hook with an empty POST. Returns whether it was sent successfully.
pub async fn trigger_build_hook(config: &Config) -> bool {
    let schedule = &config.schedule;
    let url = schedule.webhook_url.value.trim();
    if !schedule.notify_webhook.value || url.is_empty() {
        return false;
    }
    let client = match Client::builder().timeout(WEBHOOK_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            warn!("[SCHED] Webhook client failed: {}", e);
            return false;
        }
    };
    match client.post(url).send().await {
        Ok(response) if response.status().is_success() => {
            info!("[SCHED] Triggered build hook.");
            true
        }
        Ok(response) => {
            warn!("[SCHED] Build hook returned {}", response.status());
            false
        }
        Err(e) => {
            warn!("[SCHED] Build hook failed: {}", e);
            false
        }
    }
}

/// One run with every error contained. Never panics the loop.
pub async fn run_and_notify(config: &Config, store: &StoreClient, sirix: &SirixClient, label: &str) {
    info!("[SCHED] {} run starting.", label);
    match run_once(config, store, sirix).await {
        Ok(summary) => {
            info!(
                "[SCHED] {} run finished in {:.1}s",
                label, summary.elapsed_secs
            );
            trigger_build_hook(config).await;
        }
        Err(e) => error!("[SCHED] {} run error: {}", label, e),
    }
}

/// Runs forever: optional boot run, then sleep until each midnight in the configured zone
/// and run again.
pub async fn run_daily(config: &Config, store: &StoreClient, sirix: &SirixClient) {
    let label = &config.schedule.timezone_label.value;
    let zone = schedule_zone(label);
    match zone {
        Some(tz) => info!("[SCHED] Starting daily scheduler. TZ={}", tz),
        None => warn!(
            "[SCHED] Unknown timezone '{}', falling back to host local midnight.",
            label
        ),
    }
    if config.schedule.run_on_startup.value {
        run_and_notify(config, store, sirix, "Boot").await;
    } else {
        info!("[SCHED] Boot run disabled.");
    }

    loop {
        let (target, wait) = next_run(zone, Utc::now());
        info!(
            "[SCHED] Sleeping until next midnight: {} (in {}).",
            target,
            format_hms(wait)
        );
        tokio::time::sleep(wait).await;
        run_and_notify(config, store, sirix, "Midnight").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn london_midnight_from_utc_clock() {
        let london = schedule_zone("Europe/London");
        assert_eq!(london, Some(chrono_tz::Europe::London));

        // 30 Mar 2024 23:30 GMT: London midnight is 30 minutes away.
        let now = Utc.with_ymd_and_hms(2024, 3, 30, 23, 30, 0).unwrap();
        let (target, wait) = next_run(london, now);
        assert_eq!(target, "2024-03-31T00:00:00+00:00");
        assert_eq!(wait, Duration::from_secs(30 * 60));

        // Clocks go forward at 01:00 UTC, so the next midnight is 23:00 UTC, not 24:00.
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 0, 30, 0).unwrap();
        let (target, wait) = next_run(london, now);
        assert_eq!(target, "2024-04-01T00:00:00+01:00");
        assert_eq!(wait, Duration::from_secs(22 * 3600 + 30 * 60));
    }

    #[test]
    fn unknown_zone_falls_back_to_host_clock() {
        assert_eq!(schedule_zone("Mars/Olympus_Mons"), None);
        let (_, wait) = next_run(None, Utc::now());
        assert!(wait >= MIN_SLEEP);
        assert!(wait <= Duration::from_secs(25 * 3600));
    }

    #[tokio::test]
    async fn build_hook_posts_when_enabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/build_hooks/abc"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = Config::default();
        config.schedule.webhook_url.value = format!("{}/build_hooks/abc", server.uri());
        assert!(!trigger_build_hook(&config).await);

        config.schedule.notify_webhook.value = true;
        assert!(trigger_build_hook(&config).await);
    }

    #[tokio::test]
    async fn build_hook_failure_is_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut config = Config::default();
        config.schedule.notify_webhook.value = true;
        config.schedule.webhook_url.value = server.uri();
        assert!(!trigger_build_hook(&config).await);
    }
}
