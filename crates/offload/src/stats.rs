//! Per-unit counters and read-only statistics snapshots
//!
//! Nothing in here feeds back into scheduling decisions.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::task::TaskId;
use crate::unit::UnitId;

/// Monotonic counters for one unit incarnation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitStats {
    /// Requests posted to the unit
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub total_processing_time: Duration,
    pub errors: u64,
    /// Processing time of the last completed request
    pub last_task_time: Option<Duration>,
}

impl UnitStats {
    /// Mean processing time of completed requests
    pub fn average_processing_time(&self) -> Option<Duration> {
        if self.tasks_completed == 0 {
            return None;
        }
        let mean = self.total_processing_time.as_nanos() / u128::from(self.tasks_completed);
        Some(Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX)))
    }
}

/// Aggregates unit counters
#[derive(Debug, Default)]
pub struct StatsCollector {
    units: HashMap<UnitId, UnitStats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatch(&mut self, unit_id: &UnitId) {
        self.entry(unit_id).tasks_dispatched += 1;
    }

    pub fn record_success(&mut self, unit_id: &UnitId, elapsed: Duration) {
        let stats = self.entry(unit_id);
        stats.tasks_completed += 1;
        stats.total_processing_time += elapsed;
        stats.last_task_time = Some(elapsed);
    }

    pub fn record_error(&mut self, unit_id: &UnitId) {
        self.entry(unit_id).errors += 1;
    }

    /// Forget a unit's counters. Only done when the unit is replaced.
    pub fn reset(&mut self, unit_id: &UnitId) {
        self.units.remove(unit_id);
    }

    pub fn get(&self, unit_id: &UnitId) -> UnitStats {
        self.units.get(unit_id).cloned().unwrap_or_default()
    }

    fn entry(&mut self, unit_id: &UnitId) -> &mut UnitStats {
        self.units.entry(unit_id.clone()).or_default()
    }
}

/// Snapshot of one task type's pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    pub task_type: String,
    /// Live units
    pub units: usize,
    pub busy: usize,
    pub idle: usize,
    /// Tasks waiting for a unit
    pub queued: usize,
    /// Tasks submitted but not yet terminal (queued, assigned or in fallback)
    pub in_flight: usize,
    /// Whether submissions for this type go to the fallback executor
    pub fallback: bool,
}

/// Snapshot of one unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitStatistics {
    pub unit_id: UnitId,
    pub task_type: String,
    pub busy: bool,
    pub assigned_task: Option<TaskId>,
    pub generation: u64,
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub errors: u64,
    pub average_processing_time_ms: Option<f64>,
    pub last_task_time_ms: Option<f64>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let unit = UnitId::new("analytics", 0);
        let mut stats = StatsCollector::new();

        stats.record_dispatch(&unit);
        stats.record_success(&unit, Duration::from_millis(10));
        stats.record_dispatch(&unit);
        stats.record_success(&unit, Duration::from_millis(30));
        stats.record_dispatch(&unit);
        stats.record_error(&unit);

        let snapshot = stats.get(&unit);
        assert_eq!(snapshot.tasks_dispatched, 3);
        assert_eq!(snapshot.tasks_completed, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.last_task_time, Some(Duration::from_millis(30)));
        assert_eq!(
            snapshot.average_processing_time(),
            Some(Duration::from_millis(20))
        );
    }

    #[test]
    fn test_average_is_none_without_completions() {
        assert_eq!(UnitStats::default().average_processing_time(), None);
    }

    #[test]
    fn test_average_with_large_completion_count() {
        let stats = UnitStats {
            tasks_completed: 1 << 32,
            total_processing_time: Duration::from_secs(3 << 32),
            ..UnitStats::default()
        };
        assert_eq!(stats.average_processing_time(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_reset_on_replacement() {
        let unit = UnitId::new("analytics", 1);
        let mut stats = StatsCollector::new();
        stats.record_error(&unit);
        stats.reset(&unit);
        assert_eq!(stats.get(&unit), UnitStats::default());
    }
}
