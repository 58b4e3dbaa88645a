use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{TaskStatus, MAX_RETRY_COUNT};
use crate::ledger::Ledger;
use crate::matchmaker::Matchmaker;
use crate::schema_registry::SchemaRegistry;
use crate::store::Store;

#[derive(Serialize)]
struct DispatchEnvelope<'a> {
    task_id: Uuid,
    capability: &'a str,
    input_payload: &'a serde_json::Value,
    callback_url: String,
    deadline: chrono::DateTime<chrono::Utc>,
}

/// Orchestrates match → HTTP dispatch → deadline watch → fallback → terminal
/// state, per §4.6. Owns no durable state itself; every transition it makes
/// is persisted through `Store` CAS operations so a crash mid-dispatch just
/// leaves a task for the Background Runner to pick back up.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    ledger: Arc<Ledger>,
    matchmaker: Arc<Matchmaker>,
    schema_registry: Arc<SchemaRegistry>,
    http: Client,
    platform_account_id: Uuid,
    public_base_url: String,
    dispatch_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<Ledger>,
        matchmaker: Arc<Matchmaker>,
        schema_registry: Arc<SchemaRegistry>,
        platform_account_id: Uuid,
        public_base_url: String,
    ) -> Self {
        Self {
            store,
            ledger,
            matchmaker,
            schema_registry,
            http: Client::new(),
            platform_account_id,
            public_base_url,
            dispatch_timeout: Duration::from_secs(5),
        }
    }

    /// Dispatch(task) — step 1-5 of §4.6. `exclude_worker` is set by the
    /// fallback path to avoid re-selecting the worker that just failed. Only
    /// ever invoked by the Background Runner draining `dispatch_jobs`
    /// (§4.8), never recursively, so every attempt survives a crash between
    /// the job being claimed and the worker's response.
    pub async fn dispatch(self: &Arc<Self>, task_id: Uuid, exclude_worker: Option<Uuid>) {
        let task = match self.store.get_task(task_id).await {
            Ok(task) => task,
            Err(error) => {
                warn!(%task_id, %error, "dispatch: task vanished");
                return;
            }
        };
        if task.status != TaskStatus::Matching {
            return;
        }

        let best = if let Some(excluded) = exclude_worker {
            match self.matchmaker.find_fallbacks(&task, excluded).await {
                Ok(mut candidates) => candidates.drain(..).next(),
                Err(error) => {
                    warn!(%task_id, %error, "matchmaker lookup failed");
                    None
                }
            }
        } else {
            match self.matchmaker.find_best(&task).await {
                Ok(candidate) => candidate,
                Err(error) => {
                    warn!(%task_id, %error, "matchmaker lookup failed");
                    None
                }
            }
        };

        let Some(worker) = best else {
            self.refund_terminal(task_id, &[TaskStatus::Matching]).await;
            return;
        };

        let deadline_duration = match self
            .schema_registry
            .deadline_for(&task.capability, &task.input_payload)
        {
            Ok(duration) => duration,
            Err(error) => {
                warn!(%task_id, %error, "could not compute deadline");
                self.refund_terminal(task_id, &[TaskStatus::Matching]).await;
                return;
            }
        };
        let deadline = chrono::Utc::now() + chrono::Duration::from_std(deadline_duration).unwrap();

        let Ok(Some(task)) = self.store.record_dispatch(task_id, worker.agent_id, deadline).await
        else {
            return;
        };

        let Some(endpoint) = worker.endpoint_url.clone() else {
            self.after_attempt_failed(task_id, worker.agent_id).await;
            return;
        };

        let envelope = DispatchEnvelope {
            task_id: task.task_id,
            capability: &task.capability,
            input_payload: &task.input_payload,
            callback_url: format!("{}/v1/tasks/{}/result", self.public_base_url, task.task_id),
            deadline,
        };

        let outcome = self
            .http
            .post(&endpoint)
            .timeout(self.dispatch_timeout)
            .json(&envelope)
            .send()
            .await;

        match outcome {
            Ok(response) if response.status().is_success() => {
                if self.store.advance_in_progress(task_id).await.ok().flatten().is_none() {
                    return;
                }
                info!(%task_id, worker_agent_id = %worker.agent_id, "dispatched");
                let _ = self
                    .store
                    .enqueue_deadline_timer(task_id, worker.agent_id, deadline)
                    .await;
                self.schedule_deadline_watch(task_id, worker.agent_id, deadline_duration);
            }
            Ok(response) => {
                warn!(%task_id, status = %response.status(), "worker returned non-2xx");
                self.after_attempt_failed(task_id, worker.agent_id).await;
            }
            Err(error) => {
                warn!(%task_id, %error, "worker dispatch request failed");
                self.after_attempt_failed(task_id, worker.agent_id).await;
            }
        }
    }

    fn schedule_deadline_watch(self: &Arc<Self>, task_id: Uuid, worker_agent_id: Uuid, after: Duration) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            dispatcher.on_deadline(task_id, worker_agent_id).await;
        });
    }

    /// DeadlineWatcher(task_id, worker_id, deadline) per §4.6. Idempotent via
    /// the CAS in `mark_matching_for_retry`/`refund_task`: a callback that
    /// already settled the task makes this a no-op.
    pub async fn on_deadline(self: &Arc<Self>, task_id: Uuid, worker_agent_id: Uuid) {
        let task = match self.store.get_task(task_id).await {
            Ok(task) => task,
            Err(_) => return,
        };
        if task.status != TaskStatus::InProgress {
            return;
        }
        warn!(%task_id, %worker_agent_id, "deadline elapsed while in_progress");
        self.after_attempt_failed(task_id, worker_agent_id).await;
    }

    /// Fallback(task, failed_worker) per §4.6: increment retry_count; beyond
    /// `MAX_RETRY_COUNT` refund and fail terminally, otherwise enqueue a
    /// fresh dispatch job excluding the worker that just failed. Redispatch
    /// always goes through `dispatch_jobs` rather than calling `dispatch`
    /// in-process, so a crash after this point still leaves the retry for
    /// the Background Runner to pick back up (§4.8).
    async fn after_attempt_failed(self: &Arc<Self>, task_id: Uuid, failed_worker: Uuid) {
        let retried = match self.store.mark_matching_for_retry(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(error) => {
                warn!(%task_id, %error, "failed to mark task for retry");
                return;
            }
        };
        if retried.retry_count > MAX_RETRY_COUNT {
            self.refund_terminal(task_id, &[TaskStatus::Matching]).await;
            return;
        }
        if let Err(error) = self
            .store
            .enqueue_dispatch_job(task_id, Some(failed_worker))
            .await
        {
            warn!(%task_id, %error, "failed to enqueue retry dispatch job");
        }
    }

    async fn refund_terminal(&self, task_id: Uuid, from_statuses: &[TaskStatus]) {
        let error_output = json!({
            "status": "error",
            "error": { "code": "no_worker_available", "message": "dispatch exhausted without a worker accepting the task" }
        });
        match self
            .ledger
            .refund_task(task_id, from_statuses, Some(error_output))
            .await
        {
            Ok(Some(_)) => info!(%task_id, "refunded after exhausting dispatch attempts"),
            Ok(None) => {}
            Err(error) => warn!(%task_id, %error, "refund failed"),
        }
    }

    pub fn platform_account_id(&self) -> Uuid {
        self.platform_account_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Account, Agent, AgentAvailability, AgentRole, Task};
    use crate::ledger::Ledger;
    use crate::matchmaker::Matchmaker;
    use crate::store::{InMemoryStore, Store};
    use std::collections::BTreeMap;

    async fn seed(store: &InMemoryStore, budget: i64) -> (Uuid, Uuid, Uuid) {
        let requester_account = Uuid::new_v4();
        let requester_agent = Uuid::new_v4();
        let worker_account = Uuid::new_v4();
        let worker_agent = Uuid::new_v4();
        let now = chrono::Utc::now();
        store
            .seed_account(Account {
                account_id: requester_account,
                balance: budget,
                per_task_cap: None,
                per_day_cap: None,
                is_system: false,
                created_at: now,
            })
            .await;
        store
            .seed_agent(Agent {
                agent_id: requester_agent,
                account_id: requester_account,
                role: AgentRole::Requester,
                availability: AgentAvailability::Online,
                endpoint_url: None,
                capability_prices: BTreeMap::new(),
                avg_response_ms: 0.0,
                success_rate: None,
                reputation: None,
                schema_compliance: None,
                created_at: now,
            })
            .await;
        store
            .seed_account(Account {
                account_id: worker_account,
                balance: 0,
                per_task_cap: None,
                per_day_cap: None,
                is_system: false,
                created_at: now,
            })
            .await;
        let mut prices = BTreeMap::new();
        prices.insert("summarize".to_string(), 10);
        store
            .seed_agent(Agent {
                agent_id: worker_agent,
                account_id: worker_account,
                role: AgentRole::Worker,
                availability: AgentAvailability::Online,
                endpoint_url: Some("http://worker-under-test.invalid/dispatch".to_string()),
                capability_prices: prices,
                avg_response_ms: 100.0,
                success_rate: Some(0.9),
                reputation: Some(0.9),
                schema_compliance: Some(0.9),
                created_at: now,
            })
            .await;
        (requester_account, requester_agent, worker_agent)
    }

    /// Scenario 5: the dispatched worker accepts the task but never calls
    /// back before its deadline. With no fallback worker available, the
    /// deadline watcher's `on_deadline` must drive the task to `failed` and
    /// refund the requester in full, the same terminal outcome as the
    /// repeated-500s path, reached without any worker response at all.
    #[tokio::test]
    async fn deadline_elapsed_without_callback_refunds_to_failed() {
        let mem_store = Arc::new(InMemoryStore::new());
        let (requester_account, requester_agent, worker_agent) = seed(&mem_store, 100).await;
        let platform_account_id = Uuid::new_v4();
        mem_store
            .seed_account(Account {
                account_id: platform_account_id,
                balance: 0,
                per_task_cap: None,
                per_day_cap: None,
                is_system: true,
                created_at: chrono::Utc::now(),
            })
            .await;
        let store: Arc<dyn Store> = mem_store;

        let schema_registry = Arc::new(
            SchemaRegistry::load_from_dir(&std::path::PathBuf::from("config/capabilities")).unwrap(),
        );
        let ledger = Arc::new(Ledger::new(store.clone()));
        let matchmaker = Arc::new(Matchmaker::new(store.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            ledger.clone(),
            matchmaker,
            schema_registry,
            platform_account_id,
            "http://test-harness.invalid".to_string(),
        ));

        let now = chrono::Utc::now();
        let task = Task {
            task_id: Uuid::new_v4(),
            requester_agent_id: requester_agent,
            worker_agent_id: None,
            capability: "summarize".to_string(),
            input_payload: json!({"text": "never comes back"}),
            output_payload: None,
            budget: 50,
            actual_cost: None,
            platform_fee: None,
            routing_preference: crate::domain::RoutingPreference::default(),
            deadline: None,
            retry_count: 0,
            status: TaskStatus::Matching,
            created_at: now,
            updated_at: now,
        };
        let admitted = ledger.lock_credits_and_admit(task).await.unwrap();
        assert_eq!(store.get_account(requester_account).await.unwrap().balance, 50);
        // Drain the admission's own dispatch job; this test drives the
        // dispatched/in_progress transition by hand to simulate a worker
        // that accepted the task and then went silent.
        store.claim_dispatch_job().await.unwrap().expect("admission job enqueued");

        let deadline = now + chrono::Duration::seconds(15);
        store
            .record_dispatch(admitted.task_id, worker_agent, deadline)
            .await
            .unwrap();
        store.advance_in_progress(admitted.task_id).await.unwrap();

        dispatcher.on_deadline(admitted.task_id, worker_agent).await;
        let job = store.claim_dispatch_job().await.unwrap().expect("retry job enqueued");
        Dispatcher::dispatch(&dispatcher, job.task_id, job.exclude_worker).await;

        let failed = store.get_task(admitted.task_id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(store.get_account(requester_account).await.unwrap().balance, 100);
    }
}
