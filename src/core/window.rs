use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::CostError;

/// Half-open UTC interval `[start, end)`.
///
/// Every timestamp the engine reasons about lives inside one of these. The
/// batching walker and the expand operations exist for the accumulation path,
/// which stretches results back out to the originally requested range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, CostError> {
        if end <= start {
            return Err(CostError::InvalidWindow(format!(
                "end {} must be after start {}",
                end, start
            )));
        }
        Ok(Window { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn minutes(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 60.0
    }

    pub fn hours(&self) -> f64 {
        self.minutes() / 60.0
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    /// True when `other` lies entirely inside this window (closed comparison
    /// on both ends, so an interval ending exactly at `end` still counts).
    pub fn encloses(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start <= start && end <= self.end
    }

    /// Intersection with another window, if non-empty.
    pub fn overlap(&self, other: &Window) -> Option<Window> {
        let s = self.start.max(other.start);
        let e = self.end.min(other.end);
        if e > s {
            Some(Window { start: s, end: e })
        } else {
            None
        }
    }

    /// True when `other` begins exactly where this window ends.
    pub fn abuts(&self, other: &Window) -> bool {
        self.end == other.start
    }

    pub fn expand_start(&mut self, start: DateTime<Utc>) {
        if start < self.start {
            self.start = start;
        }
    }

    pub fn expand_end(&mut self, end: DateTime<Utc>) {
        if end > self.end {
            self.end = end;
        }
    }

    /// Grow this window until it covers `other`.
    pub fn expand_to(&mut self, other: &Window) {
        self.expand_start(other.start);
        self.expand_end(other.end);
    }

    /// Split into consecutive sub-windows of at most `max` each. A
    /// remainder shorter than `max` becomes its own final batch.
    pub fn batches(&self, max: Duration) -> Vec<Window> {
        if max <= Duration::zero() || self.duration() <= max {
            return vec![*self];
        }
        let mut out = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let stop = (cursor + max).min(self.end);
            out.push(Window {
                start: cursor,
                end: stop,
            });
            cursor = stop;
        }
        out
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, h, m, 0).unwrap()
    }

    #[test]
    fn rejects_inverted_window() {
        assert!(Window::new(ts(1, 0), ts(0, 0)).is_err());
        assert!(Window::new(ts(1, 0), ts(1, 0)).is_err());
    }

    #[test]
    fn batches_cover_the_window_exactly() {
        let w = Window::new(ts(0, 0), ts(2, 30)).unwrap();
        let batches = w.batches(Duration::hours(1));
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].start(), w.start());
        assert_eq!(batches[2].end(), w.end());
        for pair in batches.windows(2) {
            assert!(pair[0].abuts(&pair[1]));
        }
        assert_eq!(batches[2].minutes(), 30.0);
    }

    #[test]
    fn batches_single_when_window_fits() {
        let w = Window::new(ts(0, 0), ts(1, 0)).unwrap();
        assert_eq!(w.batches(Duration::hours(1)), vec![w]);
    }

    #[test]
    fn overlap_and_enclose() {
        let a = Window::new(ts(0, 0), ts(1, 0)).unwrap();
        let b = Window::new(ts(0, 30), ts(2, 0)).unwrap();
        let o = a.overlap(&b).unwrap();
        assert_eq!(o.start(), ts(0, 30));
        assert_eq!(o.end(), ts(1, 0));
        assert!(b.encloses(ts(1, 0), ts(2, 0)));
        assert!(!a.encloses(ts(0, 30), ts(1, 30)));

        let c = Window::new(ts(1, 0), ts(2, 0)).unwrap();
        assert!(a.overlap(&c).is_none());
        assert!(a.abuts(&c));
    }

    #[test]
    fn expand_to_covers_both() {
        let mut a = Window::new(ts(1, 0), ts(2, 0)).unwrap();
        let b = Window::new(ts(0, 0), ts(3, 0)).unwrap();
        a.expand_to(&b);
        assert_eq!(a, b);
    }
}
