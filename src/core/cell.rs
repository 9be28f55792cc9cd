//! Write-once output cells.
//!
//! An output cell stands for a property of a resource that does not exist
//! yet, such as an identifier assigned by the cloud provider. Downstream
//! nodes declare their inputs in terms of cells; the orchestrator resolves a
//! cell exactly once, when the owning node's operation succeeds, or fails it
//! when the owner fails or is skipped.
//!
//! Readers either register a continuation with [`OutputCell::on_ready`] or
//! suspend on [`OutputCell::wait`]. Neither polls.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;

use crate::domain::{NodeError, NodeId};

/// Callback run once the cell reaches a terminal state
pub type Continuation = Box<dyn FnOnce(&CellOutcome) + Send + 'static>;

/// Observable state of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    Pending,
    Resolved,
    Failed,
}

impl fmt::Display for CellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Terminal value of a cell
#[derive(Debug, Clone, PartialEq)]
pub enum CellOutcome {
    Resolved(Value),
    Failed(NodeError),
}

impl CellOutcome {
    /// Convert into the value or the owner's failure
    pub fn into_result(self) -> Result<Value, NodeError> {
        match self {
            Self::Resolved(value) => Ok(value),
            Self::Failed(error) => Err(error),
        }
    }
}

/// Misuse of the write-once contract
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    #[error("output '{cell}' was already {status}")]
    DoubleResolution { cell: String, status: CellStatus },
}

struct Slot {
    outcome: Option<CellOutcome>,
    continuations: Vec<Continuation>,
}

struct Inner {
    owner: NodeId,
    name: String,
    slot: Mutex<Slot>,
    notify: Notify,
}

/// A write-once, shareable future value owned by one resource node.
///
/// Clones share the same underlying cell.
#[derive(Clone)]
pub struct OutputCell {
    inner: Arc<Inner>,
}

impl OutputCell {
    /// Create a pending cell for output `name` of node `owner`
    pub fn new(owner: NodeId, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                owner,
                name: name.into(),
                slot: Mutex::new(Slot {
                    outcome: None,
                    continuations: Vec::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Node that resolves this cell
    pub fn owner(&self) -> &NodeId {
        &self.inner.owner
    }

    /// Output name on the owning node
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// `owner.name`, for messages
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.inner.owner, self.inner.name)
    }

    /// Whether two handles point at the same cell
    pub fn same_cell(&self, other: &OutputCell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state
    pub fn status(&self) -> CellStatus {
        match self.lock().outcome {
            None => CellStatus::Pending,
            Some(CellOutcome::Resolved(_)) => CellStatus::Resolved,
            Some(CellOutcome::Failed(_)) => CellStatus::Failed,
        }
    }

    /// Terminal outcome, if reached. Never blocks.
    pub fn try_get(&self) -> Option<CellOutcome> {
        self.lock().outcome.clone()
    }

    /// Transition Pending -> Resolved and wake every reader
    pub fn resolve(&self, value: Value) -> Result<(), CellError> {
        self.complete(CellOutcome::Resolved(value))
    }

    /// Transition Pending -> Failed and wake every reader
    pub fn fail(&self, error: NodeError) -> Result<(), CellError> {
        self.complete(CellOutcome::Failed(error))
    }

    fn complete(&self, outcome: CellOutcome) -> Result<(), CellError> {
        let continuations = {
            let mut slot = self.lock();
            if let Some(ref existing) = slot.outcome {
                let status = match existing {
                    CellOutcome::Resolved(_) => CellStatus::Resolved,
                    CellOutcome::Failed(_) => CellStatus::Failed,
                };
                return Err(CellError::DoubleResolution {
                    cell: self.qualified_name(),
                    status,
                });
            }
            slot.outcome = Some(outcome.clone());
            std::mem::take(&mut slot.continuations)
        };

        self.inner.notify.notify_waiters();
        // Registration order, outside the lock so continuations may read the cell
        for continuation in continuations {
            continuation(&outcome);
        }
        Ok(())
    }

    /// Run `continuation` once the cell is terminal.
    ///
    /// Runs immediately on the calling task if the cell already is.
    pub fn on_ready<F>(&self, continuation: F)
    where
        F: FnOnce(&CellOutcome) + Send + 'static,
    {
        let outcome = {
            let mut slot = self.lock();
            match slot.outcome {
                Some(ref outcome) => outcome.clone(),
                None => {
                    slot.continuations.push(Box::new(continuation));
                    return;
                }
            }
        };
        continuation(&outcome);
    }

    /// Suspend until the cell is terminal, then return its value or the
    /// owner's failure
    pub async fn wait(&self) -> Result<Value, NodeError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a resolve in between is not missed
            notified.as_mut().enable();

            if let Some(outcome) = self.try_get() {
                return outcome.into_result();
            }
            notified.await;
        }
    }
}

impl fmt::Debug for OutputCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputCell")
            .field("owner", &self.inner.owner)
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use serde_json::json;
    use std::time::Duration;

    fn cell() -> OutputCell {
        OutputCell::new(NodeId::new("Bucket"), "arn")
    }

    #[test]
    fn test_resolve_once() {
        let cell = cell();
        assert_eq!(cell.status(), CellStatus::Pending);
        assert!(cell.try_get().is_none());

        cell.resolve(json!("arn:bucket")).unwrap();
        assert_eq!(cell.status(), CellStatus::Resolved);
        assert_eq!(cell.try_get(), Some(CellOutcome::Resolved(json!("arn:bucket"))));

        let err = cell.resolve(json!("arn:other")).unwrap_err();
        assert_eq!(
            err,
            CellError::DoubleResolution {
                cell: "Bucket.arn".to_string(),
                status: CellStatus::Resolved,
            }
        );
        // Value is immutable after the first resolution
        assert_eq!(cell.try_get(), Some(CellOutcome::Resolved(json!("arn:bucket"))));
    }

    #[test]
    fn test_fail_after_resolve_is_rejected() {
        let cell = cell();
        cell.fail(NodeError::new(ErrorKind::ProvisionerPermanent, "denied"))
            .unwrap();
        assert!(cell.resolve(json!("late")).is_err());
        assert_eq!(cell.status(), CellStatus::Failed);
    }

    #[test]
    fn test_continuations_run_in_registration_order() {
        let cell = cell();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            cell.on_ready(move |outcome| {
                assert!(matches!(outcome, CellOutcome::Resolved(_)));
                order.lock().unwrap().push(i);
            });
        }
        assert!(order.lock().unwrap().is_empty());

        cell.resolve(json!(1)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_on_ready_runs_immediately_when_terminal() {
        let cell = cell();
        cell.fail(NodeError::new(ErrorKind::Timeout, "slow")).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        cell.on_ready(move |outcome| {
            *sink.lock().unwrap() = Some(outcome.clone());
        });

        assert!(matches!(
            seen.lock().unwrap().as_ref(),
            Some(CellOutcome::Failed(e)) if e.kind == ErrorKind::Timeout
        ));
    }

    #[tokio::test]
    async fn test_wait_suspends_until_resolved() {
        let cell = cell();
        let reader = cell.clone();
        let handle = tokio::spawn(async move { reader.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        cell.resolve(json!("arn:bucket")).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), json!("arn:bucket"));
    }

    #[tokio::test]
    async fn test_wait_propagates_failure() {
        let cell = cell();
        let reader = cell.clone();
        let handle = tokio::spawn(async move { reader.wait().await });

        cell.fail(NodeError::upstream(vec![NodeId::new("Role"), NodeId::new("Bucket")]))
            .unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::UpstreamFailure);
        assert_eq!(err.root_cause(), Some(&NodeId::new("Role")));
    }

    #[test]
    fn test_wait_is_pending_until_woken() {
        let cell = cell();
        let mut wait = tokio_test::task::spawn(cell.wait());

        tokio_test::assert_pending!(wait.poll());
        assert!(!wait.is_woken());

        cell.resolve(json!("arn:bucket")).unwrap();
        assert!(wait.is_woken());
        let value = tokio_test::assert_ready!(wait.poll());
        assert_eq!(value.unwrap(), json!("arn:bucket"));
    }

    #[tokio::test]
    async fn test_wait_on_resolved_cell_returns_immediately() {
        let cell = cell();
        cell.resolve(json!(42)).unwrap();
        assert_eq!(cell.wait().await.unwrap(), json!(42));
    }

    #[test]
    fn test_clones_share_state() {
        let a = cell();
        let b = a.clone();
        assert!(a.same_cell(&b));
        assert!(!a.same_cell(&cell()));

        b.resolve(json!(true)).unwrap();
        assert_eq!(a.status(), CellStatus::Resolved);
    }
}
