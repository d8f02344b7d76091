//! Fixed-size pool of execution units for one task type
//!
//! Units live in an index-addressed arena; a [`UnitId`]'s index is its slot,
//! so busy/idle bookkeeping is O(1) and independent of handler identity.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{spawn_unit, Assignment, UnitFactory, UnitId};
use crate::dispatcher::Event;
use crate::error::SchedulerError;
use crate::task::TaskId;

/// Running incarnation of a unit
pub(crate) struct UnitRuntime {
    inbox: mpsc::UnboundedSender<Assignment>,
    join: JoinHandle<()>,
}

impl Drop for UnitRuntime {
    fn drop(&mut self) {
        self.join.abort();
    }
}

struct UnitSlot {
    id: UnitId,
    generation: u64,
    assigned: Option<TaskId>,
    last_used_at: Option<DateTime<Utc>>,
    runtime: Option<UnitRuntime>,
}

impl UnitSlot {
    fn is_live(&self) -> bool {
        self.runtime.is_some()
    }
}

/// Units serving one task type
pub struct WorkerPool {
    task_type: String,
    factory: Arc<dyn UnitFactory>,
    events: mpsc::Sender<Event>,
    slots: Vec<UnitSlot>,
}

impl WorkerPool {
    /// Create `concurrency` units
    ///
    /// A unit that fails to start is logged and left out; the pool degrades
    /// to fewer units instead of failing.
    #[instrument(skip(factory, events))]
    pub(crate) fn initialize(
        task_type: &str,
        concurrency: usize,
        factory: Arc<dyn UnitFactory>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        let mut pool = Self {
            task_type: task_type.to_string(),
            factory,
            events,
            slots: Vec::with_capacity(concurrency),
        };

        for index in 0..concurrency {
            let id = UnitId::new(task_type, index);
            let runtime = match pool.start_unit(&id, 1) {
                Ok(runtime) => Some(runtime),
                Err(err) => {
                    warn!(unit_id = %id, error = %err, "Execution unit unavailable");
                    None
                }
            };
            pool.slots.push(UnitSlot {
                id,
                generation: 1,
                assigned: None,
                last_used_at: None,
                runtime,
            });
        }

        info!(
            task_type,
            requested = concurrency,
            live = pool.live_count(),
            "Worker pool initialized"
        );
        pool
    }

    fn start_unit(&self, id: &UnitId, generation: u64) -> Result<UnitRuntime, SchedulerError> {
        let handler = self
            .factory
            .create(id)
            .map_err(|e| SchedulerError::UnitCreationFailed {
                unit_id: id.to_string(),
                reason: format!("{e:#}"),
            })?;
        let (inbox, join) = spawn_unit(id.clone(), generation, handler, self.events.clone());
        Ok(UnitRuntime { inbox, join })
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    /// Number of units currently able to take work
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_live()).count()
    }

    pub fn busy_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.is_live() && s.assigned.is_some())
            .count()
    }

    /// First live unit with nothing assigned
    pub fn find_idle(&self) -> Option<UnitId> {
        self.slots
            .iter()
            .find(|s| s.is_live() && s.assigned.is_none())
            .map(|s| s.id.clone())
    }

    fn slot(&self, unit_id: &UnitId) -> Option<&UnitSlot> {
        self.slots.get(unit_id.index()).filter(|s| s.id == *unit_id)
    }

    fn slot_mut(&mut self, unit_id: &UnitId) -> Option<&mut UnitSlot> {
        self.slots
            .get_mut(unit_id.index())
            .filter(|s| s.id == *unit_id)
    }

    pub fn is_busy(&self, unit_id: &UnitId) -> bool {
        self.slot(unit_id).is_some_and(|s| s.assigned.is_some())
    }

    /// The task assigned to a unit, if any
    pub fn assigned_task(&self, unit_id: &UnitId) -> Option<TaskId> {
        self.slot(unit_id).and_then(|s| s.assigned)
    }

    /// Current generation of a unit; bumps on every replacement
    pub fn generation(&self, unit_id: &UnitId) -> Option<u64> {
        self.slot(unit_id).map(|s| s.generation)
    }

    pub fn last_used_at(&self, unit_id: &UnitId) -> Option<DateTime<Utc>> {
        self.slot(unit_id).and_then(|s| s.last_used_at)
    }

    pub(crate) fn unit_ids(&self) -> impl Iterator<Item = &UnitId> {
        self.slots.iter().filter(|s| s.is_live()).map(|s| &s.id)
    }

    pub(crate) fn mark_busy(&mut self, unit_id: &UnitId, task_id: TaskId) {
        if let Some(slot) = self.slot_mut(unit_id) {
            slot.assigned = Some(task_id);
            slot.last_used_at = Some(Utc::now());
        }
    }

    pub(crate) fn mark_free(&mut self, unit_id: &UnitId) {
        if let Some(slot) = self.slot_mut(unit_id) {
            slot.assigned = None;
        }
    }

    /// Deliver an assignment to a unit's inbox
    pub(crate) fn post(&self, unit_id: &UnitId, assignment: Assignment) -> bool {
        match self.slot(unit_id).and_then(|s| s.runtime.as_ref()) {
            Some(runtime) => runtime.inbox.send(assignment).is_ok(),
            None => false,
        }
    }

    /// Terminate a unit, even mid-task, and start a fresh one under the same id
    ///
    /// If the new incarnation cannot be created the slot stays dead.
    pub(crate) fn replace(&mut self, unit_id: &UnitId) -> Result<u64, SchedulerError> {
        let generation = match self.slot_mut(unit_id) {
            Some(slot) => {
                // Dropping the runtime aborts the old task
                slot.runtime = None;
                slot.assigned = None;
                slot.generation += 1;
                slot.generation
            }
            None => {
                return Err(SchedulerError::UnitCreationFailed {
                    unit_id: unit_id.to_string(),
                    reason: "unknown unit".to_string(),
                })
            }
        };

        let runtime = self.start_unit(unit_id, generation)?;
        if let Some(slot) = self.slot_mut(unit_id) {
            slot.runtime = Some(runtime);
        }
        debug!(%unit_id, generation, "Execution unit replaced");
        Ok(generation)
    }

    /// Terminate every unit
    pub(crate) fn shutdown(&mut self) {
        for slot in &mut self.slots {
            slot.runtime = None;
            slot.assigned = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UnitRequest;
    use crate::unit::{UnitContext, UnitHandler, UnitResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop;

    #[async_trait]
    impl UnitHandler for Noop {
        async fn handle(&self, _request: UnitRequest, _ctx: UnitContext) -> UnitResult {
            Ok(json!(null))
        }
    }

    fn noop_factory() -> Arc<dyn UnitFactory> {
        Arc::new(|_: &UnitId| -> anyhow::Result<Arc<dyn UnitHandler>> { Ok(Arc::new(Noop)) })
    }

    #[tokio::test]
    async fn test_initialize_creates_units() {
        let (tx, _rx) = mpsc::channel(8);
        let pool = WorkerPool::initialize("analytics", 3, noop_factory(), tx);

        assert_eq!(pool.live_count(), 3);
        assert_eq!(pool.busy_count(), 0);
        assert_eq!(pool.find_idle(), Some(UnitId::new("analytics", 0)));
    }

    #[tokio::test]
    async fn test_creation_failure_degrades_pool() {
        let (tx, _rx) = mpsc::channel(8);
        let factory: Arc<dyn UnitFactory> =
            Arc::new(|id: &UnitId| -> anyhow::Result<Arc<dyn UnitHandler>> {
                if id.index() == 1 {
                    anyhow::bail!("no memory for unit");
                }
                Ok(Arc::new(Noop))
            });

        let pool = WorkerPool::initialize("analytics", 3, factory, tx);
        assert_eq!(pool.live_count(), 2);
        let ids: Vec<_> = pool.unit_ids().map(|id| id.index()).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_busy_tracking() {
        let (tx, _rx) = mpsc::channel(8);
        let mut pool = WorkerPool::initialize("analytics", 2, noop_factory(), tx);
        let first = UnitId::new("analytics", 0);

        pool.mark_busy(&first, TaskId::new(1));
        assert!(pool.is_busy(&first));
        assert_eq!(pool.assigned_task(&first), Some(TaskId::new(1)));
        assert!(pool.last_used_at(&first).is_some());
        assert_eq!(pool.find_idle(), Some(UnitId::new("analytics", 1)));

        pool.mark_free(&first);
        assert!(!pool.is_busy(&first));
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn test_replace_keeps_identity_and_bumps_generation() {
        let (tx, _rx) = mpsc::channel(8);
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let factory: Arc<dyn UnitFactory> =
            Arc::new(move |_: &UnitId| -> anyhow::Result<Arc<dyn UnitHandler>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(Noop))
            });

        let mut pool = WorkerPool::initialize("analytics", 1, factory, tx);
        let unit = UnitId::new("analytics", 0);
        pool.mark_busy(&unit, TaskId::new(5));

        let generation = pool.replace(&unit).unwrap();
        assert_eq!(generation, 2);
        assert_eq!(pool.generation(&unit), Some(2));
        assert_eq!(pool.assigned_task(&unit), None);
        assert_eq!(pool.live_count(), 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_replacement_leaves_dead_slot() {
        let (tx, _rx) = mpsc::channel(8);
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let factory: Arc<dyn UnitFactory> =
            Arc::new(move |_: &UnitId| -> anyhow::Result<Arc<dyn UnitHandler>> {
                if counter.fetch_add(1, Ordering::SeqCst) > 0 {
                    anyhow::bail!("host refused new unit");
                }
                Ok(Arc::new(Noop))
            });

        let mut pool = WorkerPool::initialize("analytics", 1, factory, tx);
        let unit = UnitId::new("analytics", 0);

        let err = pool.replace(&unit).unwrap_err();
        assert!(matches!(err, SchedulerError::UnitCreationFailed { .. }));
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.find_idle(), None);
    }
}
