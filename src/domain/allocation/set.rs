use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::window::Window;
use crate::domain::allocation::allocation::Allocation;
use crate::domain::allocation::props::{AllocationFilter, AllocationProperty};

/// All allocations of one sub-window, keyed by name, plus the free-form
/// error and warning strings the computation gathered along the way.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocationSet {
    pub allocations: BTreeMap<String, Allocation>,
    pub window: Window,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl AllocationSet {
    pub fn new(window: Window) -> Self {
        AllocationSet {
            allocations: BTreeMap::new(),
            window,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Allocation> {
        self.allocations.get(name)
    }

    /// Insert one allocation; a name collision folds the newcomer into the
    /// existing record, which keeps names unique by construction.
    pub fn insert(&mut self, alloc: Allocation) {
        match self.allocations.get_mut(&alloc.name) {
            Some(existing) => existing.add(&alloc),
            None => {
                self.allocations.insert(alloc.name.clone(), alloc);
            }
        }
    }

    /// Drop every allocation the filter rejects. Runs before aggregation so
    /// filters on dimensions the aggregation erases still apply.
    pub fn filter(&mut self, filter: &AllocationFilter) {
        if filter.is_empty() {
            return;
        }
        self.allocations.retain(|_, a| filter.matches(a));
    }

    /// Re-key every allocation by the joined values of the aggregation
    /// properties, folding collisions together. Idle and unmounted records
    /// keep their own identity instead of collapsing into one another.
    pub fn aggregate_by(&mut self, properties: &[AllocationProperty]) {
        if properties.is_empty() {
            return;
        }
        let old = std::mem::take(&mut self.allocations);
        for (_, mut alloc) in old {
            alloc.name = aggregation_name(&alloc, properties);
            match self.allocations.get_mut(&alloc.name) {
                Some(existing) => existing.add(&alloc),
                None => {
                    self.allocations.insert(alloc.name.clone(), alloc);
                }
            }
        }
    }

    /// Fold another set into this one, growing the window to cover both.
    pub fn accumulate(&mut self, other: &AllocationSet) {
        self.window.expand_to(&other.window);
        for alloc in other.allocations.values() {
            self.insert(alloc.clone());
        }
        self.errors.extend(other.errors.iter().cloned());
        self.warnings.extend(other.warnings.iter().cloned());
    }

    /// Stretch the set window and every member window out to `window`.
    /// Used after accumulation so results report the requested range.
    pub fn expand_window_to(&mut self, window: &Window) {
        self.window.expand_to(window);
        for alloc in self.allocations.values_mut() {
            if let Some(w) = &mut alloc.window {
                w.expand_to(window);
            } else {
                alloc.window = Some(*window);
            }
        }
    }

    pub fn sanitize(&mut self) {
        for alloc in self.allocations.values_mut() {
            alloc.sanitize();
        }
    }

    pub fn total_cost(&self) -> f64 {
        self.allocations.values().map(|a| a.total_cost()).sum()
    }
}

/// The name an allocation takes under an aggregation. Idle and unmounted
/// records keep their own identity; everything else re-keys by the joined
/// property values. The batching layer uses the same derivation to key its
/// metadata side maps.
pub fn aggregation_name(alloc: &Allocation, properties: &[AllocationProperty]) -> String {
    if properties.is_empty() || alloc.is_idle() || alloc.is_unmounted() {
        return alloc.name.clone();
    }
    properties
        .iter()
        .map(|p| p.value_of(alloc))
        .collect::<Vec<_>>()
        .join("/")
}
