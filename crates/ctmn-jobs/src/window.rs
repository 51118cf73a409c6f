//! Watermark-driven query windows.
//!
//! A run reads rows changed in `(since, until]` where
//!
//! - `until = now - safety_lag` (never `now` itself, so in-flight writes are not read),
//! - `since = watermark - overlap`, or `until - lookback - overlap` on a cold start.
//!
//! After the run the watermark moves to `min(max_seen, until)`, never backwards.
//! Rows re-read because of the overlap are absorbed by the sent-key check.

use chrono::{Duration, NaiveDateTime};
use ctmn_core::{truncate_to_seconds, Window};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub lookback: Duration,
    pub safety_lag: Duration,
    pub overlap: Duration,
}

impl WindowPolicy {
    pub fn compute(&self, now: NaiveDateTime, watermark: Option<NaiveDateTime>) -> Window {
        let now = truncate_to_seconds(now);
        let mut until = now - self.safety_lag;
        if until >= now {
            until = now - Duration::minutes(1);
        }

        let since_raw = watermark.unwrap_or(until - self.lookback);
        let mut since = since_raw - self.overlap;
        if since >= until {
            // Watermark at or past `until` (clock moved back); re-scan a minimal slice.
            since = until - self.overlap.max(Duration::minutes(1));
        }
        Window { since, until }
    }
}

/// Next watermark after a successful run over `window`.
///
/// `max_seen` is the newest modification timestamp returned by the query, or
/// `None` for an empty result, in which case the watermark moves to `until`.
pub fn advance_watermark(
    previous: Option<NaiveDateTime>,
    max_seen: Option<NaiveDateTime>,
    window: &Window,
) -> NaiveDateTime {
    let candidate = match max_seen {
        Some(seen) => seen.min(window.until),
        None => window.until,
    };
    match previous {
        Some(previous) => previous.max(candidate),
        None => candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").expect("timestamp")
    }

    fn policy() -> WindowPolicy {
        WindowPolicy {
            lookback: Duration::hours(1),
            safety_lag: Duration::minutes(10),
            overlap: Duration::minutes(3),
        }
    }

    #[test]
    fn cold_start_window() {
        let window = policy().compute(ts("2024-01-01T10:00:00"), None);
        assert_eq!(window.since, ts("2024-01-01T08:47:00"));
        assert_eq!(window.until, ts("2024-01-01T09:50:00"));
    }

    #[test]
    fn warm_start_subtracts_overlap_from_watermark() {
        let window = policy().compute(ts("2024-01-01T11:00:00"), Some(ts("2024-01-01T09:50:00")));
        assert_eq!(window.since, ts("2024-01-01T09:47:00"));
        assert_eq!(window.until, ts("2024-01-01T10:50:00"));
    }

    #[test]
    fn zero_safety_lag_still_stays_before_now() {
        let policy = WindowPolicy {
            safety_lag: Duration::zero(),
            ..policy()
        };
        let now = ts("2024-01-01T10:00:00");
        let window = policy.compute(now, None);
        assert_eq!(window.until, ts("2024-01-01T09:59:00"));
        assert!(window.until < now);
    }

    #[test]
    fn sub_second_now_is_truncated() {
        let now = ts("2024-01-01T10:00:00") + Duration::milliseconds(750);
        let window = policy().compute(now, None);
        assert_eq!(window.until, ts("2024-01-01T09:50:00"));
    }

    #[test]
    fn watermark_ahead_of_until_still_yields_non_empty_window() {
        let window = policy().compute(ts("2024-01-01T10:00:00"), Some(ts("2024-01-01T12:00:00")));
        assert!(window.since < window.until);
        assert_eq!(window.since, ts("2024-01-01T09:47:00"));
    }

    #[test]
    fn bounds_hold_across_many_inputs() {
        let base = ts("2024-03-10T00:00:00");
        for lag in [0, 1, 10, 45] {
            for overlap in [0, 3, 30] {
                for offset_min in [-600i64, -61, -5, 0, 5, 600] {
                    let policy = WindowPolicy {
                        lookback: Duration::hours(1),
                        safety_lag: Duration::minutes(lag),
                        overlap: Duration::minutes(overlap),
                    };
                    let now = base + Duration::hours(5);
                    let watermark = Some(now + Duration::minutes(offset_min));
                    for mark in [None, watermark] {
                        let w = policy.compute(now, mark);
                        assert!(w.until < now, "until {} !< now {}", w.until, now);
                        assert!(w.since < w.until, "since {} !< until {}", w.since, w.until);
                    }
                }
            }
        }
    }

    #[test]
    fn empty_result_advances_to_until() {
        let window = Window {
            since: ts("2024-01-01T08:47:00"),
            until: ts("2024-01-01T09:50:00"),
        };
        assert_eq!(advance_watermark(None, None, &window), window.until);
    }

    #[test]
    fn sparse_data_leaves_watermark_below_until() {
        let window = Window {
            since: ts("2024-01-01T08:47:00"),
            until: ts("2024-01-01T09:50:00"),
        };
        let next = advance_watermark(Some(ts("2024-01-01T08:50:00")), Some(ts("2024-01-01T09:00:00")), &window);
        assert_eq!(next, ts("2024-01-01T09:00:00"));
        assert!(next < window.until);
    }

    #[test]
    fn watermark_is_capped_at_until_and_never_regresses() {
        let window = Window {
            since: ts("2024-01-01T08:47:00"),
            until: ts("2024-01-01T09:50:00"),
        };
        let capped = advance_watermark(None, Some(ts("2024-01-01T09:55:00")), &window);
        assert_eq!(capped, window.until);

        let previous = ts("2024-01-01T09:20:00");
        let kept = advance_watermark(Some(previous), Some(ts("2024-01-01T08:48:00")), &window);
        assert_eq!(kept, previous);
    }
}
