use chrono::{DateTime, Duration, Utc};

use crate::core::window::Window;
use crate::source::types::Sample;

/// Derive the active `[start, end]` interval of an entity from its sample
/// series, clamped to the query window and to `now`.
///
/// A single-sample series is widened by half the resolution on each side so
/// that a pod observed exactly once is still credited one resolution's worth
/// of activity rather than an instantaneous, zero-cost blip.
///
/// Returns `None` for an empty series or when clamping leaves nothing; the
/// caller skips the row.
pub fn active_interval(
    samples: &[Sample],
    resolution: Duration,
    window: &Window,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let first = samples.first()?;
    let last = samples.last()?;

    let mut start = first.timestamp;
    let mut end = last.timestamp;
    if start == end {
        start -= resolution / 2;
        end += resolution / 2;
    }

    start = start.max(window.start());
    end = end.min(window.end()).min(now);

    if end <= start {
        return None;
    }
    Some((start, end))
}

/// Hours between two instants, never negative.
pub fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    if end <= start {
        return 0.0;
    }
    (end - start).num_seconds() as f64 / 3600.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap() + Duration::minutes(min as i64)
    }

    fn sample(min: u32) -> Sample {
        Sample {
            timestamp: ts(min),
            value: 1.0,
        }
    }

    #[test]
    fn empty_series_is_skipped() {
        let w = Window::new(ts(0), ts(60)).unwrap();
        assert!(active_interval(&[], Duration::minutes(1), &w, ts(60)).is_none());
    }

    #[test]
    fn single_sample_widens_to_one_resolution() {
        let w = Window::new(ts(0), ts(60)).unwrap();
        let (s, e) =
            active_interval(&[sample(30)], Duration::minutes(2), &w, ts(60)).unwrap();
        assert_eq!(s, ts(29));
        assert_eq!(e, ts(31));
    }

    #[test]
    fn clamps_to_window_and_now() {
        let w = Window::new(ts(10), ts(50)).unwrap();
        let series = [sample(0), sample(30), sample(59)];
        let (s, e) = active_interval(&series, Duration::minutes(1), &w, ts(40)).unwrap();
        assert_eq!(s, ts(10));
        assert_eq!(e, ts(40));
    }

    #[test]
    fn fully_future_series_is_skipped() {
        let w = Window::new(ts(0), ts(60)).unwrap();
        let series = [sample(50), sample(55)];
        assert!(active_interval(&series, Duration::minutes(1), &w, ts(45)).is_none());
    }

    #[test]
    fn hours_between_is_non_negative() {
        assert_eq!(hours_between(ts(30), ts(0)), 0.0);
        assert!((hours_between(ts(0), ts(90)) - 1.5).abs() < 1e-9);
    }
}
