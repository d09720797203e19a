//! Container-fleet cost allocation.
//!
//! The engine scatters a fixed catalogue of time-series queries over a
//! window, assembles the pod/volume/service graphs, prices resource hours
//! with per-node unit prices, and returns allocations that can be filtered,
//! aggregated, and accumulated.

pub mod cluster;
pub mod core;
pub mod domain;
pub mod errors;
pub mod pricing;
pub mod source;

pub use crate::domain::allocation::allocation::Allocation;
pub use crate::domain::allocation::props::{AccumulateOption, AllocationFilter, AllocationProperty};
pub use crate::domain::allocation::range::AllocationSetRange;
pub use crate::domain::allocation::set::AllocationSet;
pub use crate::domain::engine::batch::AllocationRequest;
pub use crate::domain::engine::{AllocationEngine, ComputeOptions};
pub use crate::errors::CostError;
pub use crate::source::data_source::{AllocationQuery, DataSource};
pub use crate::source::prometheus::PrometheusSource;
