use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const PLATFORM_FEE_BPS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Requester,
    Worker,
    Both,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requester => "requester",
            Self::Worker => "worker",
            Self::Both => "both",
        }
    }

    pub fn can_serve_as_worker(self) -> bool {
        matches!(self, Self::Worker | Self::Both)
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "requester" => Some(Self::Requester),
            "worker" => Some(Self::Worker),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAvailability {
    Online,
    Offline,
}

impl AgentAvailability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPreference {
    Fastest,
    Cheapest,
    Auto,
}

impl Default for RoutingPreference {
    fn default() -> Self {
        Self::Auto
    }
}

impl RoutingPreference {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fastest => "fastest",
            Self::Cheapest => "cheapest",
            Self::Auto => "auto",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "fastest" => Some(Self::Fastest),
            "cheapest" => Some(Self::Cheapest),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Matching,
    Dispatched,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Matching => "matching",
            Self::Dispatched => "dispatched",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "matching" => Some(Self::Matching),
            "dispatched" => Some(Self::Dispatched),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Success,
    Partial,
    Error,
}

impl OutputStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn pays_worker(self) -> bool {
        matches!(self, Self::Success | Self::Partial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    EscrowLock,
    EscrowRelease,
    TaskEarning,
    PlatformFee,
    Refund,
}

impl LedgerEntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EscrowLock => "escrow_lock",
            Self::EscrowRelease => "escrow_release",
            Self::TaskEarning => "task_earning",
            Self::PlatformFee => "platform_fee",
            Self::Refund => "refund",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "escrow_lock" => Some(Self::EscrowLock),
            "escrow_release" => Some(Self::EscrowRelease),
            "task_earning" => Some(Self::TaskEarning),
            "platform_fee" => Some(Self::PlatformFee),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: Uuid,
    pub balance: i64,
    pub per_task_cap: Option<i64>,
    pub per_day_cap: Option<i64>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: Uuid,
    pub account_id: Uuid,
    pub role: AgentRole,
    pub availability: AgentAvailability,
    pub endpoint_url: Option<String>,
    /// capability name -> price per task, in credits
    pub capability_prices: std::collections::BTreeMap<String, i64>,
    pub avg_response_ms: f64,
    pub success_rate: Option<f64>,
    pub reputation: Option<f64>,
    pub schema_compliance: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn capabilities_offered(&self) -> impl Iterator<Item = &str> {
        self.capability_prices.keys().map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub requester_agent_id: Uuid,
    pub worker_agent_id: Option<Uuid>,
    pub capability: String,
    pub input_payload: Value,
    pub output_payload: Option<Value>,
    pub budget: i64,
    pub actual_cost: Option<i64>,
    pub platform_fee: Option<i64>,
    pub routing_preference: RoutingPreference,
    pub deadline: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const MAX_RETRY_COUNT: i32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub account_id: Uuid,
    pub task_id: Option<Uuid>,
    pub kind: LedgerEntryKind,
    pub amount: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

/// Resolved (account, agent) pair for an authenticated caller. The core
/// consumes this; it never mints one itself.
#[derive(Debug, Clone)]
pub struct Principal {
    pub account_id: Uuid,
    pub agent_id: Uuid,
}

/// Computes the 10% platform fee split used by settlement, per §4.2.
pub fn split_settlement(actual_cost: i64, budget: i64) -> (i64, i64, i64) {
    let effective_cost = actual_cost.clamp(0, budget);
    let platform_fee = (effective_cost * PLATFORM_FEE_BPS) / 100;
    let worker_earning = effective_cost - platform_fee;
    let remainder = (budget - effective_cost).max(0);
    (worker_earning, platform_fee, remainder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_settlement_matches_scenario_one() {
        let (worker, fee, remainder) = split_settlement(80, 100);
        assert_eq!(worker, 72);
        assert_eq!(fee, 8);
        assert_eq!(remainder, 20);
    }

    #[test]
    fn split_settlement_floors_small_fee() {
        let (worker, fee, remainder) = split_settlement(3, 3);
        assert_eq!(worker, 3);
        assert_eq!(fee, 0);
        assert_eq!(remainder, 0);
    }

    #[test]
    fn split_settlement_clamps_cost_above_budget() {
        let (worker, fee, remainder) = split_settlement(150, 100);
        assert_eq!(worker + fee, 100);
        assert_eq!(remainder, 0);
    }
}
