use std::sync::Arc;

use crate::domain::{Agent, RoutingPreference, Task};
use crate::store::{Store, StoreError};

/// Scores and ranks available workers for a task per §4.5. Holds no state of
/// its own beyond a handle to the persistence layer, the same shape as the
/// teacher's free `select_provider_for_capability` helper in `marketplace.rs`,
/// generalized into scored ranking instead of a single best-match lookup.
pub struct Matchmaker {
    store: Arc<dyn Store>,
}

impl Matchmaker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn ranked_candidates(
        &self,
        task: &Task,
        exclude: Option<uuid::Uuid>,
    ) -> Result<Vec<Agent>, StoreError> {
        let mut candidates = self.store.list_worker_candidates(&task.capability).await?;
        candidates.retain(|agent| Some(agent.agent_id) != exclude);
        candidates.retain(|agent| {
            agent
                .capability_prices
                .get(&task.capability)
                .is_some_and(|price| *price <= task.budget)
        });
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let max_price = candidates
            .iter()
            .filter_map(|a| a.capability_prices.get(&task.capability).copied())
            .max()
            .unwrap_or(1)
            .max(1) as f64;
        let max_ms = candidates
            .iter()
            .map(|a| a.avg_response_ms)
            .fold(0.0_f64, f64::max)
            .max(1.0);

        // Stable sort preserves store insertion order for ties, per §4.5.
        candidates.sort_by(|a, b| {
            let score_a = score(task, a, &task.routing_preference, max_price, max_ms);
            let score_b = score(task, b, &task.routing_preference, max_price, max_ms);
            score_a
                .partial_cmp(&score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates)
    }

    /// FindBest — the single best worker, or `None` if no candidate survives
    /// filtering (the dispatcher then refunds).
    pub async fn find_best(&self, task: &Task) -> Result<Option<Agent>, StoreError> {
        Ok(self.ranked_candidates(task, None).await?.into_iter().next())
    }

    /// FindFallbacks — ordered alternatives excluding `failed_worker`,
    /// bounded to 2.
    pub async fn find_fallbacks(
        &self,
        task: &Task,
        failed_worker: uuid::Uuid,
    ) -> Result<Vec<Agent>, StoreError> {
        let mut ranked = self.ranked_candidates(task, Some(failed_worker)).await?;
        ranked.truncate(2);
        Ok(ranked)
    }
}

/// Lower is better: all three preference strategies are normalized so the
/// sort below always picks the minimum.
fn score(
    task: &Task,
    agent: &Agent,
    preference: &RoutingPreference,
    max_price: f64,
    max_ms: f64,
) -> f64 {
    let price = agent
        .capability_prices
        .get(&task.capability)
        .copied()
        .unwrap_or(i64::MAX) as f64;
    match preference {
        RoutingPreference::Fastest => agent.avg_response_ms,
        RoutingPreference::Cheapest => price,
        RoutingPreference::Auto => {
            let schema_compliance = agent.schema_compliance.unwrap_or(0.0);
            let success_rate = agent.success_rate.unwrap_or(0.5);
            let reputation = agent.reputation.unwrap_or(0.5);
            let price_term = 1.0 - (price / max_price);
            let ms_term = 1.0 - (agent.avg_response_ms / max_ms);
            let weighted = 0.20 * schema_compliance
                + 0.25 * success_rate
                + 0.25 * reputation
                + 0.15 * price_term
                + 0.15 * ms_term;
            // Higher weighted score is better; negate so ascending sort wins.
            -weighted
        }
    }
}
