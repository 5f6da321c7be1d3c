//! Refresh cadence as a pure function of viewing recency: recently-viewed
//! codebases refresh often, stale ones taper off, and ninety days of silence
//! stops refreshes entirely.

use crate::repo::CodebaseRefreshInfo;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Repeated failures open the circuit; a manual success resets it.
pub const FAILURE_CIRCUIT_THRESHOLD: i32 = 5;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// Step table from idle days (since last view) to the interval between
/// refreshes. `None` means never.
pub fn refresh_interval(idle_days: i64) -> Option<Duration> {
    match idle_days {
        d if d < 0 => None,
        0..=7 => Some(Duration::from_secs(6 * HOUR)),
        8..=14 => Some(Duration::from_secs(12 * HOUR)),
        15..=30 => Some(Duration::from_secs(DAY)),
        31..=60 => Some(Duration::from_secs(3 * DAY)),
        61..=90 => Some(Duration::from_secs(7 * DAY)),
        _ => None,
    }
}

pub fn should_refresh(info: &CodebaseRefreshInfo, now: DateTime<Utc>) -> bool {
    if info.last_viewed_at > now {
        return false;
    }
    if info.consecutive_failures >= FAILURE_CIRCUIT_THRESHOLD {
        return false;
    }
    let idle_days = (now - info.last_viewed_at).num_days();
    let Some(interval) = refresh_interval(idle_days) else {
        return false;
    };
    match info.last_completed_at {
        None => true,
        Some(completed) => now >= completed + interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use rstest::rstest;
    use uuid::Uuid;

    fn info(
        viewed_days_ago: i64,
        completed_hours_ago: Option<i64>,
        failures: i32,
        now: DateTime<Utc>,
    ) -> CodebaseRefreshInfo {
        CodebaseRefreshInfo {
            id: Uuid::new_v4(),
            host: "github.com".to_owned(),
            owner: "octocat".to_owned(),
            name: "Hello-World".to_owned(),
            last_commit_sha: Some("abc".to_owned()),
            last_viewed_at: now - TimeDelta::days(viewed_days_ago),
            last_completed_at: completed_hours_ago.map(|hours| now - TimeDelta::hours(hours)),
            consecutive_failures: failures,
        }
    }

    #[rstest]
    #[case(0, Some(Duration::from_secs(6 * HOUR)))]
    #[case(7, Some(Duration::from_secs(6 * HOUR)))]
    #[case(8, Some(Duration::from_secs(12 * HOUR)))]
    #[case(14, Some(Duration::from_secs(12 * HOUR)))]
    #[case(15, Some(Duration::from_secs(DAY)))]
    #[case(30, Some(Duration::from_secs(DAY)))]
    #[case(31, Some(Duration::from_secs(3 * DAY)))]
    #[case(60, Some(Duration::from_secs(3 * DAY)))]
    #[case(61, Some(Duration::from_secs(7 * DAY)))]
    #[case(90, Some(Duration::from_secs(7 * DAY)))]
    #[case(91, None)]
    #[case(365, None)]
    #[case(-1, None)]
    fn interval_table(#[case] idle_days: i64, #[case] expected: Option<Duration>) {
        assert_eq!(refresh_interval(idle_days), expected);
    }

    #[test]
    fn interval_is_monotone_in_idle_days() {
        let as_secs = |days: i64| refresh_interval(days).map(|d| d.as_secs()).unwrap_or(u64::MAX);
        for days in 0..=120 {
            assert!(
                as_secs(days) <= as_secs(days + 1),
                "interval shrank between {days} and {} days",
                days + 1
            );
        }
    }

    #[test]
    fn due_when_interval_elapsed() {
        // Viewed 20 days ago → 24h band; last completed 25h ago.
        let now = Utc::now();
        assert!(should_refresh(&info(20, Some(25), 0, now), now));
    }

    #[test]
    fn not_due_within_the_interval() {
        let now = Utc::now();
        assert!(!should_refresh(&info(20, Some(23), 0, now), now));
    }

    #[test]
    fn circuit_breaker_stops_refreshes() {
        let now = Utc::now();
        assert!(!should_refresh(
            &info(20, Some(25), FAILURE_CIRCUIT_THRESHOLD, now),
            now
        ));
        assert!(should_refresh(
            &info(20, Some(25), FAILURE_CIRCUIT_THRESHOLD - 1, now),
            now
        ));
    }

    #[test]
    fn future_view_times_never_refresh() {
        let now = Utc::now();
        assert!(!should_refresh(&info(-1, Some(25), 0, now), now));
    }

    #[test]
    fn never_completed_is_due_immediately() {
        let now = Utc::now();
        assert!(should_refresh(&info(3, None, 0, now), now));
    }

    #[test]
    fn stale_codebases_are_never_refreshed() {
        let now = Utc::now();
        assert!(!should_refresh(&info(120, Some(24 * 30), 0, now), now));
    }
}
