// Run and Step records
// Core type definitions for analysis run tracking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Run
// ============================================================================

/// Status of an analysis run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created, not yet registered
    Idle,
    /// Orchestrator is executing
    Running,
    /// All phases finished (zero signals is still a completion)
    Completed,
    /// Uncaught error outside all per-item guards
    Failed,
    /// Cooperative cancellation observed at a checkpoint
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Represents one end-to-end analysis run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier (timestamp-derived by the hosting layer)
    pub run_id: String,
    /// Optional user query steering discovery and filtering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Source selector ("financial", "all", or a comma-separated list)
    pub sources: String,
    /// Current run status
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub signal_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Run this one was derived from (rerun / update)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Run {
    pub fn new(run_id: String, query: Option<String>, sources: String) -> Self {
        Self {
            run_id,
            query,
            sources,
            status: RunStatus::Idle,
            started_at: None,
            finished_at: None,
            signal_count: 0,
            report_path: None,
            error_message: None,
            parent_run_id: None,
            user_id: None,
        }
    }
}

/// Partial update applied to a stored Run record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub signal_count: Option<u32>,
    pub report_path: Option<String>,
    pub error_message: Option<String>,
}

impl RunPatch {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, run: &mut Run) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(started_at) = self.started_at {
            run.started_at = Some(started_at);
        }
        if let Some(finished_at) = self.finished_at {
            run.finished_at = Some(finished_at);
        }
        if let Some(signal_count) = self.signal_count {
            run.signal_count = signal_count;
        }
        if let Some(report_path) = &self.report_path {
            run.report_path = Some(report_path.clone());
        }
        if let Some(error_message) = &self.error_message {
            run.error_message = Some(error_message.clone());
        }
    }
}

// ============================================================================
// Step
// ============================================================================

/// Kind of step log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    System,
    Config,
    Phase,
    Thought,
    ToolCall,
    Result,
    Signal,
    Warning,
    Error,
    Status,
}

/// One ordered, immutable log entry within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Monotonic per-run sequence id, assigned by the store on append
    #[serde(default)]
    pub seq: u64,
    pub run_id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Producer label (System / IntentAgent / TrendAgent / FinAgent / ReportAgent)
    pub agent: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Step {
    pub fn new(step_type: StepType, agent: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            seq: 0,
            run_id: String::new(),
            step_type,
            agent: agent.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// Hosting-layer request/response shapes
// ============================================================================

/// Request body for starting a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_sources")]
    pub sources: String,
    /// Items fetched per source
    #[serde(default = "default_wide")]
    pub wide: u32,
    /// Concurrency bound for the per-item analysis phase
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_sources() -> String {
    "financial".to_string()
}

fn default_wide() -> u32 {
    10
}

fn default_concurrency() -> usize {
    1
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            query: None,
            sources: default_sources(),
            wide: default_wide(),
            concurrency: default_concurrency(),
            user_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub run_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// Lightweight summary of a run for history listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub signal_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
}

impl HistoryItem {
    pub fn from_run(run: &Run) -> Self {
        let duration_seconds = match (run.started_at, run.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        };
        Self {
            run_id: run.run_id.clone(),
            query: run.query.clone(),
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            signal_count: run.signal_count,
            duration_seconds,
            parent_run_id: run.parent_run_id.clone(),
            report_path: run.report_path.clone(),
        }
    }
}

/// All runs that share one query text, newest run first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryGroup {
    pub query: String,
    pub run_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runs: Vec<HistoryItem>,
}
