use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::domain::{split_settlement, Task, TaskStatus};
use crate::store::{Store, StoreError};

/// Errors raised by the three escrow operations in §4.2.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Double-entry credit movements: lock, settle, refund. All three are
/// transactional at the store layer; this component only does the business
/// arithmetic (the 10% fee split) and account resolution.
pub struct Ledger {
    store: Arc<dyn Store>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// LockCredits(tx, account, task, amount) — locks `task.budget` from the
    /// requester's account and persists the task in `matching`.
    pub async fn lock_credits_and_admit(&self, task: Task) -> Result<Task, LedgerError> {
        let requester = self.store.get_agent(task.requester_agent_id).await?;
        match self.store.lock_and_admit_task(task, requester.account_id).await? {
            Some(task) => Ok(task),
            None => Err(LedgerError::InsufficientFunds),
        }
    }

    /// SettleTask(tx, task, requester, worker, budget, actual_cost) per §4.2.
    /// `effective_cost` must already be clamped to `[0, budget]` by the
    /// caller (the Dispatcher, per the Open Question resolved in DESIGN.md).
    pub async fn settle_task(
        &self,
        task_id: Uuid,
        worker_agent_id: Uuid,
        output_payload: Value,
        effective_cost: i64,
        budget: i64,
        platform_account_id: Uuid,
    ) -> Result<Option<Task>, LedgerError> {
        let task = self.store.get_task(task_id).await?;
        let requester = self.store.get_agent(task.requester_agent_id).await?;
        let worker = self.store.get_agent(worker_agent_id).await?;
        let (_, platform_fee, _) = split_settlement(effective_cost, budget);
        let task = self
            .store
            .settle_task(
                task_id,
                requester.account_id,
                worker.account_id,
                platform_account_id,
                output_payload,
                effective_cost,
                platform_fee,
            )
            .await?;
        Ok(task)
    }

    /// RefundFailed(tx, task, requester, budget) per §4.2. `from_statuses`
    /// lets the caller express which states this refund may legally CAS out
    /// of (matching, dispatched, or in_progress, depending on the failure
    /// path in §4.6).
    pub async fn refund_task(
        &self,
        task_id: Uuid,
        from_statuses: &[TaskStatus],
        output_payload: Option<Value>,
    ) -> Result<Option<Task>, LedgerError> {
        let task = self.store.get_task(task_id).await?;
        let requester = self.store.get_agent(task.requester_agent_id).await?;
        let task = self
            .store
            .refund_task(task_id, from_statuses, requester.account_id, output_payload)
            .await?;
        Ok(task)
    }
}
