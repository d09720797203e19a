use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::window::Window;
use crate::errors::CostError;
use crate::source::data_source::{AllocationQuery, DataSource};
use crate::source::types::MetricRow;

/// How a group's failures affect the computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupKind {
    /// Any error fails the whole computation atomically (after all
    /// siblings have completed).
    Required,
    /// Errors degrade to warnings; missing data simply attributes no cost.
    Optional,
}

/// Scatter-gather primitive over one window.
///
/// `run` futures are awaited together (typically via `tokio::join!`); a
/// failing query never cancels its siblings; all queries run to completion
/// and the caller inspects the collected error list afterwards. The request
/// cancellation token is the only thing that stops work early.
pub struct QueryGroup<'a> {
    source: &'a dyn DataSource,
    window: Window,
    cancel: CancellationToken,
    kind: GroupKind,
    errors: Mutex<Vec<String>>,
}

impl<'a> QueryGroup<'a> {
    pub fn new(
        source: &'a dyn DataSource,
        window: Window,
        cancel: CancellationToken,
        kind: GroupKind,
    ) -> Self {
        QueryGroup {
            source,
            window,
            cancel,
            kind,
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Run one catalogue query. On failure the error is recorded and an
    /// empty row list is returned so siblings keep going.
    pub async fn run(&self, query: AllocationQuery) -> Vec<MetricRow> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.record(format!("{}: cancelled", query.name()));
                Vec::new()
            }
            res = self.source.query_range(query, &self.window) => match res {
                Ok(rows) => {
                    debug!("{}: {} row(s) over {}", query.name(), rows.len(), self.window);
                    rows
                }
                Err(err) => {
                    self.record(format!("{}: {}", query.name(), err));
                    Vec::new()
                }
            }
        }
    }

    fn record(&self, message: String) {
        match self.kind {
            GroupKind::Required => warn!("required query failed: {}", message),
            GroupKind::Optional => warn!("optional query failed: {}", message),
        }
        let mut errors = match self.errors.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        errors.push(message);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors().is_empty()
    }

    /// Collected error list, in completion order.
    pub fn errors(&self) -> Vec<String> {
        match self.errors.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Composite error for a required group, `None` when clean or optional.
    pub fn error(&self) -> Option<CostError> {
        if self.kind != GroupKind::Required {
            return None;
        }
        let errors = self.errors();
        if errors.is_empty() {
            None
        } else {
            Some(CostError::FatalInput(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};

    struct FlakySource;

    #[async_trait]
    impl DataSource for FlakySource {
        async fn query_range(
            &self,
            query: AllocationQuery,
            _window: &Window,
        ) -> Result<Vec<MetricRow>> {
            match query {
                AllocationQuery::Pods => Ok(vec![MetricRow::default()]),
                _ => Err(anyhow!("boom")),
            }
        }

        fn resolution(&self) -> Duration {
            Duration::minutes(1)
        }

        fn batch_duration(&self) -> Duration {
            Duration::hours(24)
        }
    }

    fn window() -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 9, 1, 1, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn siblings_survive_a_failure() {
        let source = FlakySource;
        let group = QueryGroup::new(
            &source,
            window(),
            CancellationToken::new(),
            GroupKind::Required,
        );
        let (pods, cpu) = tokio::join!(
            group.run(AllocationQuery::Pods),
            group.run(AllocationQuery::CpuCoresAllocated)
        );
        assert_eq!(pods.len(), 1);
        assert!(cpu.is_empty());
        assert!(group.has_errors());
        assert!(matches!(group.error(), Some(CostError::FatalInput(_))));
    }

    #[tokio::test]
    async fn optional_group_never_yields_a_composite_error() {
        let source = FlakySource;
        let group = QueryGroup::new(
            &source,
            window(),
            CancellationToken::new(),
            GroupKind::Optional,
        );
        group.run(AllocationQuery::RamUsageAvg).await;
        assert!(group.has_errors());
        assert!(group.error().is_none());
        assert_eq!(group.errors().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_records_and_returns_empty() {
        let source = FlakySource;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let group = QueryGroup::new(&source, window(), cancel, GroupKind::Optional);
        let rows = group.run(AllocationQuery::Pods).await;
        assert!(rows.is_empty());
        assert!(group.has_errors());
    }
}
