use std::sync::Arc;

use chrono::{FixedOffset, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::Account;
use crate::store::Store;

pub const ALLOWED_CAPABILITIES: &[&str] = &["research", "summarize", "data_extraction"];

#[derive(Debug, thiserror::Error)]
pub enum BudgetGateError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

#[derive(Debug, Clone)]
pub struct TaskCreateRequest {
    pub requester_agent_id: Uuid,
    pub capability_required: String,
    pub input_payload: Value,
    pub budget: i64,
    pub routing_preference: Option<String>,
}

/// Invoked before admission for task-creation requests (§4.4). Leaves the
/// request untouched so downstream handlers can still read it.
pub struct BudgetGate {
    store: Arc<dyn Store>,
    canonical_timezone: FixedOffset,
}

impl BudgetGate {
    pub fn new(store: Arc<dyn Store>, canonical_timezone: FixedOffset) -> Self {
        Self {
            store,
            canonical_timezone,
        }
    }

    pub async fn check(
        &self,
        account: &Account,
        request: &TaskCreateRequest,
    ) -> Result<(), BudgetGateError> {
        if request.budget <= 0 {
            return Err(BudgetGateError::BadRequest(
                "budget must be a positive integer".to_string(),
            ));
        }
        if !ALLOWED_CAPABILITIES.contains(&request.capability_required.as_str()) {
            return Err(BudgetGateError::Forbidden(format!(
                "capability {} is not in the allow-list",
                request.capability_required
            )));
        }
        if let Some(cap) = account.per_task_cap {
            if request.budget > cap {
                return Err(BudgetGateError::Forbidden(format!(
                    "budget {} exceeds per-task cap {cap}",
                    request.budget
                )));
            }
        }
        if let Some(cap) = account.per_day_cap {
            let today_in_zone = Utc::now().with_timezone(&self.canonical_timezone).date_naive();
            let midnight = self
                .canonical_timezone
                .from_local_datetime(&today_in_zone.and_hms_opt(0, 0, 0).unwrap())
                .single()
                .unwrap()
                .with_timezone(&Utc);
            let spend_today = self.store.today_escrow_spend(account.account_id, midnight).await?;
            if spend_today + request.budget > cap {
                return Err(BudgetGateError::Forbidden(format!(
                    "budget {} plus today's spend {spend_today} exceeds per-day cap {cap}",
                    request.budget
                )));
            }
        }
        Ok(())
    }
}
