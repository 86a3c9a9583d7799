use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use gatehouse_core::error::{GatehouseError, Result};
use gatehouse_core::instance::{InstanceRecord, InstanceStatus};
use gatehouse_core::types::InstanceId;

use crate::graph::CompiledGraph;

/// A loaded instance: its durable record plus runtime-only state.
pub(crate) struct InstanceHandle {
    pub id: InstanceId,
    /// History, pending map and settings, guarded together.
    pub record: Mutex<InstanceRecord>,
    run_lock: Arc<Mutex<()>>,
    /// Built on first execution; never persisted.
    graph: OnceCell<Arc<CompiledGraph>>,
    cancel: std::sync::Mutex<Option<CancellationToken>>,
    /// Set once the instance is deleted; nothing may write it back afterwards.
    deleted: AtomicBool,
}

/// Proof that the holder owns the single in-flight run of an instance.
pub(crate) struct RunGuard {
    _lock: OwnedMutexGuard<()>,
}

impl InstanceHandle {
    pub fn new(record: InstanceRecord) -> Self {
        Self {
            id: record.id.clone(),
            record: Mutex::new(record),
            run_lock: Arc::new(Mutex::new(())),
            graph: OnceCell::new(),
            cancel: std::sync::Mutex::new(None),
            deleted: AtomicBool::new(false),
        }
    }

    /// Wrap a record read back from the store.
    ///
    /// A record persisted mid-run belongs to a process that no longer exists,
    /// so it is marked failed.
    pub fn restore(mut record: InstanceRecord) -> Self {
        if record.status == InstanceStatus::Running {
            warn!(instance_id = %record.id, "Instance was persisted mid-run, marking failed");
            record.status = InstanceStatus::Failed;
            record.touch();
        }
        Self::new(record)
    }

    /// Claim the run slot, failing if another run holds it.
    pub fn try_begin_run(&self) -> Result<(RunGuard, CancellationToken)> {
        let lock = self
            .run_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| GatehouseError::InstanceBusy(self.id.to_string()))?;
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = Some(token.clone());
        }
        Ok((RunGuard { _lock: lock }, token))
    }

    /// Clear the cancel token once a run has stopped.
    pub fn end_run(&self) {
        if let Ok(mut slot) = self.cancel.lock() {
            *slot = None;
        }
    }

    /// Cancel the in-flight run, if any.
    pub fn cancel(&self) -> bool {
        match self.cancel.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Wait until no run is in flight.
    pub async fn wait_idle(&self) {
        let _ = self.run_lock.lock().await;
    }

    pub async fn graph<F, Fut>(&self, init: F) -> Result<Arc<CompiledGraph>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Arc<CompiledGraph>>>,
    {
        self.graph.get_or_try_init(init).await.cloned()
    }

    pub fn graph_is_built(&self) -> bool {
        self.graph.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::instance::ToolConfirmationSettings;

    fn handle() -> InstanceHandle {
        InstanceHandle::new(InstanceRecord::new("flow", ToolConfirmationSettings::default()))
    }

    #[test]
    fn second_run_is_rejected_while_first_holds_the_slot() {
        let h = handle();
        let (guard, _token) = h.try_begin_run().unwrap();
        assert!(matches!(h.try_begin_run(), Err(GatehouseError::InstanceBusy(_))));
        drop(guard);
        h.end_run();
        assert!(h.try_begin_run().is_ok());
    }

    #[test]
    fn cancel_reaches_the_current_token() {
        let h = handle();
        assert!(!h.cancel());
        let (_guard, token) = h.try_begin_run().unwrap();
        assert!(h.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn deleted_flag_sticks() {
        let h = handle();
        assert!(!h.is_deleted());
        h.mark_deleted();
        assert!(h.is_deleted());
    }

    #[tokio::test]
    async fn restoring_a_running_record_marks_it_failed() {
        let mut record = InstanceRecord::new("flow", ToolConfirmationSettings::default());
        record.status = InstanceStatus::Running;
        let h = InstanceHandle::restore(record);
        assert_eq!(h.record.lock().await.status, InstanceStatus::Failed);
        assert!(!h.graph_is_built());
    }
}
