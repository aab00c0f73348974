use std::cmp::Ordering;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::Mirror;

/// Rolling health record of a single mirror.
#[derive(Debug, Clone, Default)]
pub struct MirrorStats {
    pub successes: u64,
    pub failures: u64,
    /// Exponentially weighted moving average of successful response times
    pub avg_response_ms: Option<f64>,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
}

impl MirrorStats {
    fn failed_within(&self, window: Duration, now: Instant) -> bool {
        self.last_failure
            .is_some_and(|at| now.saturating_duration_since(at) < window)
    }
}

/// Health stats for every mirror that has been tried, keyed by base URL.
///
/// Each entry is locked independently, so racers reporting on different
/// mirrors never contend with each other.
pub struct StatsTable {
    entries: DashMap<String, MirrorStats>,
    alpha: f64,
    failure_window: Duration,
}

impl StatsTable {
    pub fn new(alpha: f64, failure_window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            alpha,
            failure_window,
        }
    }

    /// Record one request outcome against `base_url`
    pub fn record_outcome(&self, base_url: &str, success: bool, elapsed: Duration) {
        let now = Instant::now();
        let mut stats = self.entries.entry(base_url.to_string()).or_default();
        if success {
            let sample = elapsed.as_secs_f64() * 1000.0;
            stats.successes += 1;
            stats.last_success = Some(now);
            stats.avg_response_ms = Some(match stats.avg_response_ms {
                Some(avg) => avg + self.alpha * (sample - avg),
                None => sample,
            });
        } else {
            stats.failures += 1;
            stats.last_failure = Some(now);
        }
    }

    pub fn get(&self, base_url: &str) -> Option<MirrorStats> {
        self.entries.get(base_url).map(|s| s.clone())
    }

    /// Whether `base_url` failed within the failure window
    pub fn recently_failed(&self, base_url: &str) -> bool {
        self.entries
            .get(base_url)
            .is_some_and(|s| s.failed_within(self.failure_window, Instant::now()))
    }

    /// Sort mirrors from healthiest to least healthy.
    ///
    /// Mirrors with measured response times come first, fastest first. Mirrors
    /// never measured follow, and anything that failed within the failure
    /// window goes last. Ties keep list order.
    pub fn order(&self, mirrors: &[Mirror]) -> Vec<Mirror> {
        let now = Instant::now();
        let mut keyed: Vec<(u8, f64, &Mirror)> = mirrors
            .iter()
            .map(|mirror| match self.entries.get(&mirror.base_url) {
                Some(stats) if stats.failed_within(self.failure_window, now) => {
                    (2, f64::MAX, mirror)
                }
                Some(stats) => match stats.avg_response_ms {
                    Some(avg) => (0, avg, mirror),
                    None => (1, f64::MAX, mirror),
                },
                None => (1, f64::MAX, mirror),
            })
            .collect();

        keyed.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
        });
        keyed.into_iter().map(|(_, _, m)| m.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StatsTable {
        StatsTable::new(0.1, Duration::from_secs(300))
    }

    fn urls(mirrors: &[Mirror]) -> Vec<&str> {
        mirrors.iter().map(|m| m.base_url.as_str()).collect()
    }

    #[test]
    fn ewma_moves_a_tenth_toward_each_sample() {
        let stats = table();
        stats.record_outcome("a", true, Duration::from_millis(100));
        stats.record_outcome("a", true, Duration::from_millis(200));

        let a = stats.get("a").unwrap();
        assert_eq!(a.successes, 2);
        let avg = a.avg_response_ms.unwrap();
        assert!((avg - 110.0).abs() < 1e-6, "avg was {avg}");
    }

    #[test]
    fn failures_count_but_do_not_touch_average() {
        let stats = table();
        stats.record_outcome("a", false, Duration::from_secs(3));
        let a = stats.get("a").unwrap();
        assert_eq!(a.failures, 1);
        assert!(a.avg_response_ms.is_none());
        assert!(a.last_failure.is_some());
        assert!(stats.recently_failed("a"));
    }

    #[test]
    fn recently_failed_mirror_sorts_after_healthy_one() {
        let stats = table();
        let mirrors = vec![Mirror::from_url("http://bad/"), Mirror::from_url("http://good/")];
        stats.record_outcome("http://bad/", true, Duration::from_millis(5));
        stats.record_outcome("http://bad/", false, Duration::from_millis(5));
        stats.record_outcome("http://good/", true, Duration::from_millis(500));

        assert_eq!(urls(&stats.order(&mirrors)), ["http://good/", "http://bad/"]);
    }

    #[test]
    fn unknown_mirrors_sit_between_measured_and_failed() {
        let stats = table();
        let mirrors = vec![
            Mirror::from_url("http://failed/"),
            Mirror::from_url("http://unknown/"),
            Mirror::from_url("http://slow/"),
            Mirror::from_url("http://fast/"),
        ];
        stats.record_outcome("http://failed/", false, Duration::from_millis(1));
        stats.record_outcome("http://slow/", true, Duration::from_millis(900));
        stats.record_outcome("http://fast/", true, Duration::from_millis(20));

        assert_eq!(
            urls(&stats.order(&mirrors)),
            ["http://fast/", "http://slow/", "http://unknown/", "http://failed/"]
        );
    }

    #[test]
    fn old_failures_no_longer_demote() {
        let stats = StatsTable::new(0.1, Duration::ZERO);
        let mirrors = vec![Mirror::from_url("http://a/"), Mirror::from_url("http://b/")];
        stats.record_outcome("http://a/", true, Duration::from_millis(10));
        stats.record_outcome("http://a/", false, Duration::from_millis(10));
        stats.record_outcome("http://b/", true, Duration::from_millis(50));

        assert_eq!(urls(&stats.order(&mirrors)), ["http://a/", "http://b/"]);
    }
}
