use chrono::{Datelike, Timelike};
use serde::{Deserialize, Serialize};

use crate::core::window::Window;
use crate::errors::CostError;
use crate::domain::allocation::props::AccumulateOption;
use crate::domain::allocation::set::AllocationSet;

/// Ordered, non-overlapping allocation sets covering a contiguous window.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AllocationSetRange {
    pub sets: Vec<AllocationSet>,
}

impl AllocationSetRange {
    pub fn new() -> Self {
        AllocationSetRange::default()
    }

    /// Append the next sub-window's set. Consecutive sets must abut exactly.
    pub fn append(&mut self, set: AllocationSet) -> Result<(), CostError> {
        if let Some(last) = self.sets.last() {
            if !last.window.abuts(&set.window) {
                return Err(CostError::Accumulation(format!(
                    "set window {} does not abut previous {}",
                    set.window, last.window
                )));
            }
        }
        self.sets.push(set);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Union window of the whole range.
    pub fn window(&self) -> Option<Window> {
        let mut iter = self.sets.iter();
        let mut window = iter.next()?.window;
        for set in iter {
            window.expand_to(&set.window);
        }
        Some(window)
    }

    /// Fold the entire range into exactly one set.
    pub fn accumulate(&self) -> Result<AllocationSet, CostError> {
        let mut iter = self.sets.iter();
        let mut folded = iter
            .next()
            .ok_or_else(|| CostError::Accumulation("cannot accumulate an empty range".into()))?
            .clone();
        for set in iter {
            folded.accumulate(set);
        }
        Ok(folded)
    }

    /// Regroup the range by calendar bucket. `None` is the identity; `All`
    /// folds everything into a single set.
    pub fn accumulate_by(&self, option: AccumulateOption) -> Result<AllocationSetRange, CostError> {
        if option == AccumulateOption::None || self.sets.is_empty() {
            return Ok(self.clone());
        }
        if option == AccumulateOption::All {
            return Ok(AllocationSetRange {
                sets: vec![self.accumulate()?],
            });
        }

        let mut out: Vec<AllocationSet> = Vec::new();
        let mut current_bucket: Option<String> = None;
        for set in &self.sets {
            let bucket = bucket_of(&set.window, option);
            match (&current_bucket, out.last_mut()) {
                (Some(b), Some(last)) if *b == bucket => last.accumulate(set),
                _ => {
                    out.push(set.clone());
                    current_bucket = Some(bucket);
                }
            }
        }
        Ok(AllocationSetRange { sets: out })
    }
}

fn bucket_of(window: &Window, option: AccumulateOption) -> String {
    let t = window.start();
    match option {
        AccumulateOption::Hour => format!("{}-{}", t.date_naive(), t.hour()),
        AccumulateOption::Day => t.date_naive().to_string(),
        AccumulateOption::Week => format!("{}-w{}", t.iso_week().year(), t.iso_week().week()),
        AccumulateOption::Month => format!("{}-{}", t.year(), t.month()),
        AccumulateOption::Quarter => format!("{}-q{}", t.year(), (t.month() - 1) / 3 + 1),
        AccumulateOption::None | AccumulateOption::All => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::approx_eq;
    use crate::domain::allocation::allocation::{Allocation, AllocationProperties};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 1, h, 0, 0).unwrap()
    }

    fn hour_set(h: u32, cpu_cost: f64) -> AllocationSet {
        let window = Window::new(ts(h), ts(h) + Duration::hours(1)).unwrap();
        let mut set = AllocationSet::new(window);
        let mut alloc = Allocation::new(
            AllocationProperties {
                cluster: "c1".into(),
                node: "n1".into(),
                namespace: "default".into(),
                pod: "web-0".into(),
                container: "main".into(),
                ..Default::default()
            },
            window,
        );
        alloc.cpu_cost = cpu_cost;
        set.insert(alloc);
        set
    }

    #[test]
    fn append_requires_abutting_windows() {
        let mut range = AllocationSetRange::new();
        range.append(hour_set(0, 1.0)).unwrap();
        range.append(hour_set(1, 1.0)).unwrap();
        assert!(range.append(hour_set(3, 1.0)).is_err());
    }

    #[test]
    fn accumulate_folds_to_one_set_over_the_union_window() {
        let mut range = AllocationSetRange::new();
        range.append(hour_set(0, 1.0)).unwrap();
        range.append(hour_set(1, 2.0)).unwrap();
        let folded = range.accumulate().unwrap();
        assert_eq!(folded.len(), 1);
        assert!(approx_eq(folded.total_cost(), 3.0));
        assert_eq!(folded.window.start(), ts(0));
        assert_eq!(folded.window.end(), ts(2));
    }

    #[test]
    fn accumulating_a_single_set_is_the_identity() {
        let mut range = AllocationSetRange::new();
        range.append(hour_set(5, 2.5)).unwrap();
        let folded = range.accumulate().unwrap();
        assert_eq!(folded.window, hour_set(5, 2.5).window);
        assert!(approx_eq(folded.total_cost(), 2.5));
        assert_eq!(folded.len(), 1);
    }

    #[test]
    fn accumulate_by_day_groups_calendar_days() {
        let mut range = AllocationSetRange::new();
        for h in 0..4 {
            range.append(hour_set(h, 1.0)).unwrap();
        }
        let by_all = range.accumulate_by(AccumulateOption::All).unwrap();
        assert_eq!(by_all.len(), 1);
        let by_day = range.accumulate_by(AccumulateOption::Day).unwrap();
        assert_eq!(by_day.len(), 1);
        let by_hour = range.accumulate_by(AccumulateOption::Hour).unwrap();
        assert_eq!(by_hour.len(), 4);
        let untouched = range.accumulate_by(AccumulateOption::None).unwrap();
        assert_eq!(untouched.len(), 4);
    }

    #[test]
    fn empty_range_cannot_accumulate() {
        let range = AllocationSetRange::new();
        assert!(matches!(
            range.accumulate(),
            Err(CostError::Accumulation(_))
        ));
    }
}
