//! Persistent entities and their small state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taskforge_protocol::Interpreter;
use std::fmt;
use std::str::FromStr;

// ─── Agent ──────────────────────────────────────────────────────

/// Controller-derived connectivity status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(AgentStatus::Online),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

/// A remote process able to execute scripts on behalf of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: String,
    /// Opaque shared secret presented in the handshake. Never serialized
    /// outward.
    #[serde(skip_serializing)]
    pub secret: String,
    /// Ordered allow-list entries: literal IPs, CIDR ranges, or `*`.
    pub allowed_ips: Vec<String>,
    pub status: AgentStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ─── Task ───────────────────────────────────────────────────────

/// A user-defined script bound to a target agent.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub interpreter: Interpreter,
    pub script: String,
    /// Default parameters, exposed to the script as `PARAM_*` variables.
    pub params: Map<String, Value>,
    pub agent_id: String,
    /// Optional 5-field cron expression.
    pub schedule: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when creating or replacing a task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    pub interpreter: Interpreter,
    pub script: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub agent_id: String,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

// ─── TaskRun ────────────────────────────────────────────────────

/// Lifecycle state of one execution.
///
/// Transitions obey pending → running → {success, error, cancelled};
/// terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Error | RunStatus::Cancelled
        )
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a task. Immutable once terminal.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub id: i64,
    pub task_id: i64,
    pub agent_id: String,
    pub status: RunStatus,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ─── TaskDependency ─────────────────────────────────────────────

/// When a parent's terminal state triggers a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCondition {
    #[serde(rename = "always")]
    Always,
    #[serde(rename = "on:success")]
    OnSuccess,
    #[serde(rename = "on:error")]
    OnError,
}

impl TriggerCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerCondition::Always => "always",
            TriggerCondition::OnSuccess => "on:success",
            TriggerCondition::OnError => "on:error",
        }
    }

    /// Whether a parent run ending in `status` fires this edge.
    ///
    /// `on:error` deliberately does not fire for cancelled runs.
    pub fn matches(&self, status: RunStatus) -> bool {
        match self {
            TriggerCondition::Always => status.is_terminal(),
            TriggerCondition::OnSuccess => status == RunStatus::Success,
            TriggerCondition::OnError => status == RunStatus::Error,
        }
    }
}

impl FromStr for TriggerCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(TriggerCondition::Always),
            "on:success" => Ok(TriggerCondition::OnSuccess),
            "on:error" => Ok(TriggerCondition::OnError),
            other => Err(format!("unknown trigger condition: {other}")),
        }
    }
}

/// Directed edge `parent → child` in the dependency graph.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDependency {
    pub id: i64,
    pub parent_id: i64,
    pub child_id: i64,
    pub condition: TriggerCondition,
}

// ─── Asset ──────────────────────────────────────────────────────

/// Globally named value exposed to every script as `ASSET_<KEY>`.
#[derive(Debug, Clone, Serialize)]
pub struct Asset {
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
