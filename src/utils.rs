// utils.rs
// description: Shared helpers for local time, the midnight schedule and the run report file.

// IMPORTS
use chrono::{DateTime, Duration as ChronoDuration, Local, LocalResult, NaiveTime, TimeZone};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn get_current_time() -> DateTime<Local> {
    Local::now()
}

/// Start of the next local calendar day after `now`.
pub fn next_local_midnight<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut day = now.date_naive();
    loop {
        day = day.succ_opt().unwrap_or(day);
        let midnight = day.and_time(NaiveTime::MIN);
        match tz.from_local_datetime(&midnight) {
            LocalResult::Single(dt) => return dt,
            LocalResult::Ambiguous(earliest, _) => return earliest,
            // Midnight skipped by a DST jump: the first valid instant is an hour later.
            LocalResult::None => {
                if let LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) =
                    tz.from_local_datetime(&(midnight + ChronoDuration::hours(1)))
                {
                    return dt;
                }
            }
        }
    }
}

/// Sleep until `target`, never less than `floor`.
pub fn sleep_duration_until<Tz: TimeZone>(now: &DateTime<Tz>, target: &DateTime<Tz>, floor: Duration) -> Duration {
    let secs = (target.clone() - now.clone()).num_seconds().max(0) as u64;
    Duration::from_secs(secs).max(floor)
}

pub fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

pub fn report_path(report_dir: &str, now: &DateTime<Local>) -> PathBuf {
    Path::new(report_dir).join(format!("run_report_{}.txt", now.format("%Y-%m-%d")))
}

pub fn report_log(report_path: &Path, message: &str) -> io::Result<()> {
    if let Some(parent) = report_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(report_path)?;

    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

    // Multi-line messages keep one timestamp, continuation lines are indented.
    writeln!(file, "[{}] {}", timestamp, message.replace('\n', "\n    "))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate, Timelike};

    #[test]
    fn next_midnight_is_start_of_next_day() {
        let tz = FixedOffset::east_opt(3600).unwrap();
        let now = tz
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(2024, 12, 31)
                    .unwrap()
                    .and_hms_opt(23, 59, 30)
                    .unwrap(),
            )
            .unwrap();
        let next = next_local_midnight(&now);
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(next.hour(), 0);
        assert_eq!(sleep_duration_until(&now, &next, Duration::from_secs(5)), Duration::from_secs(30));
    }

    #[test]
    fn sleep_respects_floor() {
        let now = Local::now();
        assert_eq!(
            sleep_duration_until(&now, &now, Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn hms_format() {
        assert_eq!(format_hms(Duration::from_secs(3 * 3600 + 7 * 60 + 9)), "03:07:09");
    }

    #[test]
    fn report_log_indents_continuation_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.txt");
        report_log(&path, "RUN SUMMARY\nexcluded: 3").unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("] RUN SUMMARY\n    excluded: 3\n"));
    }
}
