use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::RuntimeDb;
use crate::domain::{
    Account, Agent, AgentAvailability, AgentRole, LedgerEntry, LedgerEntryKind, RoutingPreference,
    Task, TaskStatus,
};

/// Persistence-layer error, mirroring the teacher's `CreditStoreError`: a
/// small closed set that the Task API boundary maps onto HTTP status codes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Outcome of a settlement attempt: `None` means the task was no longer in
/// `in_progress` when the CAS ran (a stale callback or a losing race against
/// the deadline watcher) and nothing was mutated.
pub type SettleOutcome = Option<Task>;
pub type RefundOutcome = Option<Task>;

#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub exclude_worker: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct DeadlineTimer {
    pub timer_id: Uuid,
    pub task_id: Uuid,
    pub worker_agent_id: Uuid,
    pub fires_at: DateTime<Utc>,
}

/// Transactional store for accounts, agents, tasks and the ledger per §4.1.
/// Each method that the spec calls out as atomic (admission, settlement,
/// refund) opens and commits its own transaction internally, the same shape
/// as the teacher's `PostgresCreditStore` methods.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_account(&self, account_id: Uuid) -> Result<Account, StoreError>;
    async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, StoreError>;

    /// Workers eligible per §4.5 step 1: role worker|both, online, owned by a
    /// non-system account, offering `capability`.
    async fn list_worker_candidates(&self, capability: &str) -> Result<Vec<Agent>, StoreError>;

    /// Sum of `escrow_lock` entries for the account since `since` (§4.4).
    async fn today_escrow_spend(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Admission: lock `task.budget` credits from `requester_account_id`,
    /// insert the task row in `matching`, and enqueue a dispatch job,
    /// atomically. Returns `Ok(None)` if the requester's balance is too low;
    /// the caller (the Ledger) turns that into `InsufficientFunds`.
    async fn lock_and_admit_task(
        &self,
        task: Task,
        requester_account_id: Uuid,
    ) -> Result<Option<Task>, StoreError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError>;
    async fn list_tasks_for_account(&self, account_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// matching -> dispatched, recording worker + deadline. `None` if the
    /// task was not in `matching` (stale retry).
    async fn record_dispatch(
        &self,
        task_id: Uuid,
        worker_agent_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// dispatched -> in_progress. `None` if the task was not `dispatched`.
    async fn advance_in_progress(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    /// dispatched|in_progress -> matching, retry_count += 1. `None` if the
    /// task was already terminal or the CAS lost a race.
    async fn mark_matching_for_retry(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    /// CAS in_progress -> completed plus the three-way settlement ledger
    /// entries from §4.2, all in one transaction. `None` if the task was no
    /// longer `in_progress`.
    #[allow(clippy::too_many_arguments)]
    async fn settle_task(
        &self,
        task_id: Uuid,
        requester_account_id: Uuid,
        worker_account_id: Uuid,
        platform_account_id: Uuid,
        output_payload: Value,
        actual_cost: i64,
        platform_fee: i64,
    ) -> Result<SettleOutcome, StoreError>;

    /// CAS `from_status` -> failed plus a `refund` ledger entry crediting the
    /// requester the full budget, in one transaction.
    async fn refund_task(
        &self,
        task_id: Uuid,
        from_statuses: &[TaskStatus],
        requester_account_id: Uuid,
        output_payload: Option<Value>,
    ) -> Result<RefundOutcome, StoreError>;

    async fn enqueue_dispatch_job(
        &self,
        task_id: Uuid,
        exclude_worker: Option<Uuid>,
    ) -> Result<(), StoreError>;
    async fn claim_dispatch_job(&self) -> Result<Option<DispatchJob>, StoreError>;
    async fn complete_dispatch_job(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn enqueue_deadline_timer(
        &self,
        task_id: Uuid,
        worker_agent_id: Uuid,
        fires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn claim_due_deadline_timers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeadlineTimer>, StoreError>;
}

fn capability_prices_from_json(value: Value) -> BTreeMap<String, i64> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_i64().map(|price| (k.clone(), price)))
                .collect()
        })
        .unwrap_or_default()
}

fn agent_role_or_internal(value: &str) -> Result<AgentRole, StoreError> {
    AgentRole::from_str(value)
        .ok_or_else(|| StoreError::Db(format!("invalid agent role in store: {value}")))
}

fn agent_availability_or_internal(value: &str) -> Result<AgentAvailability, StoreError> {
    AgentAvailability::from_str(value)
        .ok_or_else(|| StoreError::Db(format!("invalid agent availability in store: {value}")))
}

fn task_status_or_internal(value: &str) -> Result<TaskStatus, StoreError> {
    TaskStatus::from_str(value).ok_or_else(|| StoreError::Db(format!("invalid task status: {value}")))
}

fn routing_preference_or_internal(value: &str) -> Result<RoutingPreference, StoreError> {
    RoutingPreference::from_str(value)
        .ok_or_else(|| StoreError::Db(format!("invalid routing preference: {value}")))
}

// ---------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------

pub struct PostgresStore {
    db: Arc<RuntimeDb>,
}

impl PostgresStore {
    pub fn new(db: Arc<RuntimeDb>) -> Self {
        Self { db }
    }
}

fn map_account_row(row: &tokio_postgres::Row) -> Account {
    Account {
        account_id: row.get("account_id"),
        balance: row.get("balance"),
        per_task_cap: row.get("per_task_cap"),
        per_day_cap: row.get("per_day_cap"),
        is_system: row.get("is_system"),
        created_at: row.get("created_at"),
    }
}

fn map_agent_row(row: &tokio_postgres::Row) -> Result<Agent, StoreError> {
    Ok(Agent {
        agent_id: row.get("agent_id"),
        account_id: row.get("account_id"),
        role: agent_role_or_internal(row.get::<_, &str>("role"))?,
        availability: agent_availability_or_internal(row.get::<_, &str>("availability"))?,
        endpoint_url: row.get("endpoint_url"),
        capability_prices: capability_prices_from_json(row.get("capability_prices")),
        avg_response_ms: row.get("avg_response_ms"),
        success_rate: row.get("success_rate"),
        reputation: row.get("reputation"),
        schema_compliance: row.get("schema_compliance"),
        created_at: row.get("created_at"),
    })
}

fn map_task_row(row: &tokio_postgres::Row) -> Result<Task, StoreError> {
    Ok(Task {
        task_id: row.get("task_id"),
        requester_agent_id: row.get("requester_agent_id"),
        worker_agent_id: row.get("worker_agent_id"),
        capability: row.get("capability"),
        input_payload: row.get("input_payload"),
        output_payload: row.get("output_payload"),
        budget: row.get("budget"),
        actual_cost: row.get("actual_cost"),
        platform_fee: row.get("platform_fee"),
        routing_preference: routing_preference_or_internal(row.get::<_, &str>("routing_preference"))?,
        deadline: row.get("deadline"),
        retry_count: row.get("retry_count"),
        status: task_status_or_internal(row.get::<_, &str>("status"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const TASK_COLUMNS: &str = "task_id, requester_agent_id, worker_agent_id, capability, \
    input_payload, output_payload, budget, actual_cost, platform_fee, routing_preference, \
    deadline, retry_count, status, created_at, updated_at";

#[async_trait]
impl Store for PostgresStore {
    async fn get_account(&self, account_id: Uuid) -> Result<Account, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT account_id, balance, per_task_cap, per_day_cap, is_system, created_at \
                 FROM accounts WHERE account_id = $1",
                &[&account_id],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))?;
        Ok(map_account_row(&row))
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                "SELECT agent_id, account_id, role, availability, endpoint_url, \
                 capability_prices, avg_response_ms, success_rate, reputation, \
                 schema_compliance, created_at FROM agents WHERE agent_id = $1",
                &[&agent_id],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))?;
        map_agent_row(&row)
    }

    async fn list_worker_candidates(&self, capability: &str) -> Result<Vec<Agent>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT a.agent_id, a.account_id, a.role, a.availability, a.endpoint_url, \
                 a.capability_prices, a.avg_response_ms, a.success_rate, a.reputation, \
                 a.schema_compliance, a.created_at \
                 FROM agents a JOIN accounts acc ON acc.account_id = a.account_id \
                 WHERE a.role IN ('worker', 'both') \
                   AND a.availability = 'online' \
                   AND acc.is_system = FALSE \
                   AND a.capability_prices ? $1 \
                 ORDER BY a.created_at ASC",
                &[&capability],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        rows.iter().map(map_agent_row).collect()
    }

    async fn today_escrow_spend(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                "SELECT COALESCE(SUM(amount), 0) AS spend FROM ledger_entries \
                 WHERE account_id = $1 AND kind = 'escrow_lock' AND created_at >= $2",
                &[&account_id, &since],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(row.get("spend"))
    }

    async fn lock_and_admit_task(
        &self,
        task: Task,
        requester_account_id: Uuid,
    ) -> Result<Option<Task>, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;

        let row = tx
            .query_one(
                "SELECT balance FROM accounts WHERE account_id = $1 FOR UPDATE",
                &[&requester_account_id],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        let balance: i64 = row.get("balance");
        if balance < task.budget {
            tx.commit().await.map_err(|e| StoreError::Db(e.to_string()))?;
            return Ok(None);
        }

        let new_balance = balance - task.budget;
        tx.execute(
            "UPDATE accounts SET balance = $2 WHERE account_id = $1",
            &[&requester_account_id, &new_balance],
        )
        .await
        .map_err(|e| StoreError::Db(e.to_string()))?;
        tx.execute(
            "INSERT INTO ledger_entries (entry_id, account_id, task_id, kind, amount, balance_after) \
             VALUES ($1, $2, $3, 'escrow_lock', $4, $5)",
            &[
                &Uuid::new_v4(),
                &requester_account_id,
                &task.task_id,
                &task.budget,
                &new_balance,
            ],
        )
        .await
        .map_err(|e| StoreError::Db(e.to_string()))?;

        tx.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS}) VALUES \
                 ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)"
            ),
            &[
                &task.task_id,
                &task.requester_agent_id,
                &task.worker_agent_id,
                &task.capability,
                &task.input_payload,
                &task.output_payload,
                &task.budget,
                &task.actual_cost,
                &task.platform_fee,
                &task.routing_preference.as_str(),
                &task.deadline,
                &task.retry_count,
                &task.status.as_str(),
                &task.created_at,
                &task.updated_at,
            ],
        )
        .await
        .map_err(|e| StoreError::Db(e.to_string()))?;

        tx.execute(
            "INSERT INTO dispatch_jobs (job_id, task_id, exclude_worker) VALUES ($1, $2, NULL)",
            &[&Uuid::new_v4(), &task.task_id],
        )
        .await
        .map_err(|e| StoreError::Db(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(Some(task))
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = $1"),
                &[&task_id],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;
        map_task_row(&row)
    }

    async fn list_tasks_for_account(&self, account_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                "SELECT t.task_id, t.requester_agent_id, t.worker_agent_id, t.capability, \
                 t.input_payload, t.output_payload, t.budget, t.actual_cost, t.platform_fee, \
                 t.routing_preference, t.deadline, t.retry_count, t.status, t.created_at, \
                 t.updated_at \
                 FROM tasks t JOIN agents a ON a.agent_id = t.requester_agent_id \
                 WHERE a.account_id = $1 ORDER BY t.created_at DESC",
                &[&account_id],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        rows.iter().map(map_task_row).collect()
    }

    async fn record_dispatch(
        &self,
        task_id: Uuid,
        worker_agent_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        let row = tx
            .query_opt(
                &format!(
                    "UPDATE tasks SET status = 'dispatched', worker_agent_id = $2, \
                     deadline = $3, updated_at = now() \
                     WHERE task_id = $1 AND status = 'matching' RETURNING {TASK_COLUMNS}"
                ),
                &[&task_id, &worker_agent_id, &deadline],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        let task = row.as_ref().map(map_task_row).transpose()?;
        tx.commit().await.map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(task)
    }

    async fn advance_in_progress(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE tasks SET status = 'in_progress', updated_at = now() \
                     WHERE task_id = $1 AND status = 'dispatched' RETURNING {TASK_COLUMNS}"
                ),
                &[&task_id],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        row.as_ref().map(map_task_row).transpose()
    }

    async fn mark_matching_for_retry(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE tasks SET status = 'matching', retry_count = retry_count + 1, \
                     updated_at = now() \
                     WHERE task_id = $1 AND status IN ('dispatched', 'in_progress') \
                     RETURNING {TASK_COLUMNS}"
                ),
                &[&task_id],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        row.as_ref().map(map_task_row).transpose()
    }

    async fn settle_task(
        &self,
        task_id: Uuid,
        requester_account_id: Uuid,
        worker_account_id: Uuid,
        platform_account_id: Uuid,
        output_payload: Value,
        actual_cost: i64,
        platform_fee: i64,
    ) -> Result<SettleOutcome, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;

        let row = tx
            .query_opt(
                "SELECT budget FROM tasks WHERE task_id = $1 AND status = 'in_progress' FOR UPDATE",
                &[&task_id],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        let Some(row) = row else {
            tx.commit().await.map_err(|e| StoreError::Db(e.to_string()))?;
            return Ok(None);
        };
        let budget: i64 = row.get("budget");

        let worker_earning = actual_cost - platform_fee;
        let remainder = (budget - actual_cost).max(0);

        let mut account_ids = vec![requester_account_id, worker_account_id, platform_account_id];
        account_ids.sort();
        account_ids.dedup();
        for account_id in &account_ids {
            tx.execute(
                "SELECT balance FROM accounts WHERE account_id = $1 FOR UPDATE",
                &[account_id],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        }

        credit_account(&tx, worker_account_id, worker_earning, Some(task_id), LedgerEntryKind::TaskEarning).await?;
        credit_account(&tx, platform_account_id, platform_fee, Some(task_id), LedgerEntryKind::PlatformFee).await?;
        if remainder > 0 {
            credit_account(&tx, requester_account_id, remainder, Some(task_id), LedgerEntryKind::EscrowRelease).await?;
        }

        let updated = tx
            .query_opt(
                &format!(
                    "UPDATE tasks SET status = 'completed', output_payload = $2, \
                     actual_cost = $3, platform_fee = $4, updated_at = now() \
                     WHERE task_id = $1 AND status = 'in_progress' RETURNING {TASK_COLUMNS}"
                ),
                &[&task_id, &output_payload, &actual_cost, &platform_fee],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        let task = updated.as_ref().map(map_task_row).transpose()?;
        tx.commit().await.map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(task)
    }

    async fn refund_task(
        &self,
        task_id: Uuid,
        from_statuses: &[TaskStatus],
        requester_account_id: Uuid,
        output_payload: Option<Value>,
    ) -> Result<RefundOutcome, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;

        let statuses: Vec<&str> = from_statuses.iter().map(|s| s.as_str()).collect();
        let row = tx
            .query_opt(
                "SELECT budget FROM tasks WHERE task_id = $1 AND status = ANY($2) FOR UPDATE",
                &[&task_id, &statuses],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        let Some(row) = row else {
            tx.commit().await.map_err(|e| StoreError::Db(e.to_string()))?;
            return Ok(None);
        };
        let budget: i64 = row.get("budget");

        tx.execute(
            "SELECT balance FROM accounts WHERE account_id = $1 FOR UPDATE",
            &[&requester_account_id],
        )
        .await
        .map_err(|e| StoreError::Db(e.to_string()))?;
        credit_account(&tx, requester_account_id, budget, Some(task_id), LedgerEntryKind::Refund).await?;

        let updated = tx
            .query_opt(
                &format!(
                    "UPDATE tasks SET status = 'failed', output_payload = COALESCE($2, output_payload), \
                     updated_at = now() \
                     WHERE task_id = $1 AND status = ANY($3) RETURNING {TASK_COLUMNS}"
                ),
                &[&task_id, &output_payload, &statuses],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        let task = updated.as_ref().map(map_task_row).transpose()?;
        tx.commit().await.map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(task)
    }

    async fn enqueue_dispatch_job(
        &self,
        task_id: Uuid,
        exclude_worker: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                "INSERT INTO dispatch_jobs (job_id, task_id, exclude_worker) VALUES ($1, $2, $3)",
                &[&Uuid::new_v4(), &task_id, &exclude_worker],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(())
    }

    async fn claim_dispatch_job(&self) -> Result<Option<DispatchJob>, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        let row = tx
            .query_opt(
                "SELECT job_id, task_id, exclude_worker FROM dispatch_jobs \
                 WHERE claimed_at IS NULL ORDER BY created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
                &[],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        let Some(row) = row else {
            tx.commit().await.map_err(|e| StoreError::Db(e.to_string()))?;
            return Ok(None);
        };
        let job = DispatchJob {
            job_id: row.get("job_id"),
            task_id: row.get("task_id"),
            exclude_worker: row.get("exclude_worker"),
        };
        tx.execute(
            "UPDATE dispatch_jobs SET claimed_at = now() WHERE job_id = $1",
            &[&job.job_id],
        )
        .await
        .map_err(|e| StoreError::Db(e.to_string()))?;
        tx.commit().await.map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(Some(job))
    }

    async fn complete_dispatch_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                "UPDATE dispatch_jobs SET done_at = now() WHERE job_id = $1",
                &[&job_id],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(())
    }

    async fn enqueue_deadline_timer(
        &self,
        task_id: Uuid,
        worker_agent_id: Uuid,
        fires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                "INSERT INTO deadline_timers (timer_id, task_id, worker_agent_id, fires_at) \
                 VALUES ($1, $2, $3, $4)",
                &[&Uuid::new_v4(), &task_id, &worker_agent_id, &fires_at],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(())
    }

    async fn claim_due_deadline_timers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeadlineTimer>, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        let rows = tx
            .query(
                "SELECT timer_id, task_id, worker_agent_id, fires_at FROM deadline_timers \
                 WHERE fired_at IS NULL AND fires_at <= $1 FOR UPDATE SKIP LOCKED",
                &[&now],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
        let mut timers = Vec::with_capacity(rows.len());
        for row in &rows {
            let timer_id: Uuid = row.get("timer_id");
            tx.execute(
                "UPDATE deadline_timers SET fired_at = now() WHERE timer_id = $1",
                &[&timer_id],
            )
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;
            timers.push(DeadlineTimer {
                timer_id,
                task_id: row.get("task_id"),
                worker_agent_id: row.get("worker_agent_id"),
                fires_at: row.get("fires_at"),
            });
        }
        tx.commit().await.map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(timers)
    }
}

async fn credit_account(
    tx: &tokio_postgres::Transaction<'_>,
    account_id: Uuid,
    amount: i64,
    task_id: Option<Uuid>,
    kind: LedgerEntryKind,
) -> Result<(), StoreError> {
    let row = tx
        .query_one(
            "UPDATE accounts SET balance = balance + $2 WHERE account_id = $1 RETURNING balance",
            &[&account_id, &amount],
        )
        .await
        .map_err(|e| StoreError::Db(e.to_string()))?;
    let balance_after: i64 = row.get("balance");
    tx.execute(
        "INSERT INTO ledger_entries (entry_id, account_id, task_id, kind, amount, balance_after) \
         VALUES ($1, $2, $3, $4, $5, $6)",
        &[
            &Uuid::new_v4(),
            &account_id,
            &task_id,
            &kind.as_str(),
            &amount,
            &balance_after,
        ],
    )
    .await
    .map_err(|e| StoreError::Db(e.to_string()))?;
    Ok(())
}

// ---------------------------------------------------------------------
// In-memory implementation, used by the test harness (§9) so the testable
// properties in §8 run without a live database.
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    accounts: HashMap<Uuid, Account>,
    agents: HashMap<Uuid, Agent>,
    tasks: HashMap<Uuid, Task>,
    ledger: Vec<LedgerEntry>,
    dispatch_jobs: Vec<DispatchJob>,
    deadline_timers: Vec<DeadlineTimer>,
}

pub struct InMemoryStore {
    inner: Mutex<MemoryInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
        }
    }

    pub async fn seed_account(&self, account: Account) {
        self.inner.lock().await.accounts.insert(account.account_id, account);
    }

    pub async fn seed_agent(&self, agent: Agent) {
        self.inner.lock().await.agents.insert(agent.agent_id, agent);
    }

    pub async fn balance_of(&self, account_id: Uuid) -> i64 {
        self.inner
            .lock()
            .await
            .accounts
            .get(&account_id)
            .map(|a| a.balance)
            .unwrap_or(0)
    }

    fn credit(inner: &mut MemoryInner, account_id: Uuid, amount: i64, task_id: Option<Uuid>, kind: LedgerEntryKind) {
        let account = inner.accounts.get_mut(&account_id).expect("account exists");
        account.balance += amount;
        inner.ledger.push(LedgerEntry {
            entry_id: Uuid::new_v4(),
            account_id,
            task_id,
            kind,
            amount,
            balance_after: account.balance,
            created_at: Utc::now(),
        });
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_account(&self, account_id: Uuid) -> Result<Account, StoreError> {
        self.inner
            .lock()
            .await
            .accounts
            .get(&account_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Agent, StoreError> {
        self.inner
            .lock()
            .await
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))
    }

    async fn list_worker_candidates(&self, capability: &str) -> Result<Vec<Agent>, StoreError> {
        let inner = self.inner.lock().await;
        let mut candidates: Vec<Agent> = inner
            .agents
            .values()
            .filter(|agent| agent.role.can_serve_as_worker())
            .filter(|agent| agent.availability == AgentAvailability::Online)
            .filter(|agent| {
                inner
                    .accounts
                    .get(&agent.account_id)
                    .map(|a| !a.is_system)
                    .unwrap_or(false)
            })
            .filter(|agent| agent.capability_prices.contains_key(capability))
            .cloned()
            .collect();
        candidates.sort_by_key(|a| a.created_at);
        Ok(candidates)
    }

    async fn today_escrow_spend(
        &self,
        account_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ledger
            .iter()
            .filter(|e| e.account_id == account_id && e.kind == LedgerEntryKind::EscrowLock && e.created_at >= since)
            .map(|e| e.amount)
            .sum())
    }

    async fn lock_and_admit_task(
        &self,
        task: Task,
        requester_account_id: Uuid,
    ) -> Result<Option<Task>, StoreError> {
        let mut inner = self.inner.lock().await;
        let balance = inner
            .accounts
            .get(&requester_account_id)
            .map(|a| a.balance)
            .ok_or_else(|| StoreError::NotFound(format!("account {requester_account_id}")))?;
        if balance < task.budget {
            return Ok(None);
        }
        {
            let account = inner.accounts.get_mut(&requester_account_id).unwrap();
            account.balance -= task.budget;
            let balance_after = account.balance;
            inner.ledger.push(LedgerEntry {
                entry_id: Uuid::new_v4(),
                account_id: requester_account_id,
                task_id: Some(task.task_id),
                kind: LedgerEntryKind::EscrowLock,
                amount: task.budget,
                balance_after,
                created_at: Utc::now(),
            });
        }
        inner.tasks.insert(task.task_id, task.clone());
        inner.dispatch_jobs.push(DispatchJob {
            job_id: Uuid::new_v4(),
            task_id: task.task_id,
            exclude_worker: None,
        });
        Ok(Some(task))
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        self.inner
            .lock()
            .await
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))
    }

    async fn list_tasks_for_account(&self, account_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| {
                inner
                    .agents
                    .get(&t.requester_agent_id)
                    .map(|a| a.account_id == account_id)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        Ok(tasks)
    }

    async fn record_dispatch(
        &self,
        task_id: Uuid,
        worker_agent_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if task.status != TaskStatus::Matching {
            return Ok(None);
        }
        task.status = TaskStatus::Dispatched;
        task.worker_agent_id = Some(worker_agent_id);
        task.deadline = Some(deadline);
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn advance_in_progress(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if task.status != TaskStatus::Dispatched {
            return Ok(None);
        }
        task.status = TaskStatus::InProgress;
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn mark_matching_for_retry(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        if !matches!(task.status, TaskStatus::Dispatched | TaskStatus::InProgress) {
            return Ok(None);
        }
        task.status = TaskStatus::Matching;
        task.retry_count += 1;
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn settle_task(
        &self,
        task_id: Uuid,
        requester_account_id: Uuid,
        worker_account_id: Uuid,
        platform_account_id: Uuid,
        output_payload: Value,
        actual_cost: i64,
        platform_fee: i64,
    ) -> Result<SettleOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let budget = match inner.tasks.get(&task_id) {
            Some(task) if task.status == TaskStatus::InProgress => task.budget,
            _ => return Ok(None),
        };

        let worker_earning = actual_cost - platform_fee;
        let remainder = (budget - actual_cost).max(0);

        Self::credit(&mut inner, worker_account_id, worker_earning, Some(task_id), LedgerEntryKind::TaskEarning);
        Self::credit(&mut inner, platform_account_id, platform_fee, Some(task_id), LedgerEntryKind::PlatformFee);
        if remainder > 0 {
            Self::credit(&mut inner, requester_account_id, remainder, Some(task_id), LedgerEntryKind::EscrowRelease);
        }

        let task = inner.tasks.get_mut(&task_id).unwrap();
        task.status = TaskStatus::Completed;
        task.output_payload = Some(output_payload);
        task.actual_cost = Some(actual_cost);
        task.platform_fee = Some(platform_fee);
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn refund_task(
        &self,
        task_id: Uuid,
        from_statuses: &[TaskStatus],
        requester_account_id: Uuid,
        output_payload: Option<Value>,
    ) -> Result<RefundOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let budget = match inner.tasks.get(&task_id) {
            Some(task) if from_statuses.contains(&task.status) => task.budget,
            _ => return Ok(None),
        };

        Self::credit(&mut inner, requester_account_id, budget, Some(task_id), LedgerEntryKind::Refund);

        let task = inner.tasks.get_mut(&task_id).unwrap();
        task.status = TaskStatus::Failed;
        if let Some(output) = output_payload {
            task.output_payload = Some(output);
        }
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn enqueue_dispatch_job(
        &self,
        task_id: Uuid,
        exclude_worker: Option<Uuid>,
    ) -> Result<(), StoreError> {
        self.inner.lock().await.dispatch_jobs.push(DispatchJob {
            job_id: Uuid::new_v4(),
            task_id,
            exclude_worker,
        });
        Ok(())
    }

    async fn claim_dispatch_job(&self) -> Result<Option<DispatchJob>, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.dispatch_jobs.is_empty() {
            return Ok(None);
        }
        Ok(Some(inner.dispatch_jobs.remove(0)))
    }

    async fn complete_dispatch_job(&self, _job_id: Uuid) -> Result<(), StoreError> {
        Ok(())
    }

    async fn enqueue_deadline_timer(
        &self,
        task_id: Uuid,
        worker_agent_id: Uuid,
        fires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.lock().await.deadline_timers.push(DeadlineTimer {
            timer_id: Uuid::new_v4(),
            task_id,
            worker_agent_id,
            fires_at,
        });
        Ok(())
    }

    async fn claim_due_deadline_timers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeadlineTimer>, StoreError> {
        let mut inner = self.inner.lock().await;
        let due: Vec<usize> = inner
            .deadline_timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.fires_at <= now)
            .map(|(i, _)| i)
            .collect();
        let mut out = Vec::with_capacity(due.len());
        for &i in due.iter().rev() {
            out.push(inner.deadline_timers.remove(i));
        }
        out.reverse();
        Ok(out)
    }
}
