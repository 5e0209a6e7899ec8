//! Wire and state model shared by the gateway, progress and tenant crates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An imperative instruction pushed by a remote agent into a UI-facing tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Optional agent-side identifier, echoed back as the correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Command {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: None,
            action: action.into(),
            parameters: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// The id the acknowledging event carries: the command id, or the action
    /// name when the agent sent none
    pub fn correlation_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.action)
    }

    /// String parameter lookup
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }
}

/// Which tool a [`ToolEvent`] speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Workspace,
    SecurityValidator,
    CodeEditor,
    TaskPlanner,
    MetricsDashboard,
}

impl std::fmt::Display for ToolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolType::Workspace => write!(f, "workspace"),
            ToolType::SecurityValidator => write!(f, "security_validator"),
            ToolType::CodeEditor => write!(f, "code_editor"),
            ToolType::TaskPlanner => write!(f, "task_planner"),
            ToolType::MetricsDashboard => write!(f, "metrics_dashboard"),
        }
    }
}

/// What kind of acknowledgement or result a [`ToolEvent`] carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEventType {
    StateChanged,
    DataChanged,
    ActionPerformed,
    Error,
}

/// Acknowledgement or result pushed back to the originating agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEvent {
    pub id: String,
    pub tool_type: ToolType,
    pub event_type: ToolEventType,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Stage of a long-running task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    #[default]
    Queued,
    Initializing,
    Analyzing,
    Processing,
    Validating,
    Finalizing,
    Completed,
    Failed,
}

/// One incremental status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(default)]
    pub stage: ProgressStage,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Aggregate view of a task's progress
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSummary {
    pub task_id: String,
    pub current_stage: ProgressStage,
    pub overall_progress: f64,
    pub current_operation: String,
    pub estimated_remaining_seconds: Option<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub stages_completed: Vec<ProgressStage>,
}

impl ProgressSummary {
    /// A summary at or past 100% is terminal
    pub fn is_complete(&self) -> bool {
        self.overall_progress >= 1.0
    }
}

/// One payload on a progress stream
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProgressStreamData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<ProgressEvent>,
    #[serde(default)]
    pub summary: ProgressSummary,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub heartbeat: bool,
}

impl ProgressStreamData {
    /// Clamp progress fractions into `[0, 1]`; NaN becomes 0.
    pub fn normalized(mut self) -> Self {
        self.summary.overall_progress = clamp_fraction(self.summary.overall_progress);
        if let Some(event) = self.event.as_mut() {
            event.progress = clamp_fraction(event.progress);
        }
        self
    }
}

fn clamp_fraction(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Lifecycle of a transport channel or progress stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Connected, or on the way there
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// The (customer, project) pair scoping all data access of a process
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TenantContext {
    pub customer_id: Option<String>,
    pub project_id: Option<String>,
}

impl TenantContext {
    pub fn new(customer_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            customer_id: Some(customer_id.into()),
            project_id: Some(project_id.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.customer_id.is_none() && self.project_id.is_none()
    }
}

impl std::fmt::Display for TenantContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}",
            self.customer_id.as_deref().unwrap_or("-"),
            self.project_id.as_deref().unwrap_or("-")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_defaults() {
        let cmd: Command = serde_json::from_str(r#"{"action":"open_panel"}"#).unwrap();
        assert_eq!(cmd.action, "open_panel");
        assert!(cmd.parameters.is_empty());
        assert!(cmd.id.is_none());
        assert_eq!(cmd.correlation_id(), "open_panel");
    }

    #[test]
    fn test_command_correlation_prefers_id() {
        let cmd = Command::new("create_task").with_id("cmd-7");
        assert_eq!(cmd.correlation_id(), "cmd-7");
    }

    #[test]
    fn test_command_param_str() {
        let cmd = Command::new("create_task")
            .with_param("title", "Fix bug")
            .with_param("priority", 2);
        assert_eq!(cmd.param_str("title"), Some("Fix bug"));
        assert_eq!(cmd.param_str("priority"), None);
        assert_eq!(cmd.param_str("missing"), None);
    }

    #[test]
    fn test_tool_event_wire_names() {
        let event = ToolEvent {
            id: "e1".to_string(),
            tool_type: ToolType::TaskPlanner,
            event_type: ToolEventType::DataChanged,
            data: Map::new(),
            timestamp: Utc::now(),
            user_id: None,
            room_id: Some("ops".to_string()),
            correlation_id: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["toolType"], "task_planner");
        assert_eq!(json["eventType"], "data_changed");
        assert_eq!(json["roomId"], "ops");
        assert!(json.get("userId").is_none());
    }

    #[test]
    fn test_partial_summary_decodes() {
        let data: ProgressStreamData =
            serde_json::from_str(r#"{"summary":{"overall_progress":1.0}}"#).unwrap();
        assert!(data.event.is_none());
        assert!(data.summary.is_complete());
        assert!(!data.heartbeat);
        assert_eq!(data.summary.current_stage, ProgressStage::Queued);
    }

    #[test]
    fn test_normalized_clamps() {
        let data = ProgressStreamData {
            event: Some(ProgressEvent {
                stage: ProgressStage::Processing,
                progress: -0.5,
                message: String::new(),
                timestamp: Utc::now(),
            }),
            summary: ProgressSummary {
                overall_progress: 1.7,
                ..Default::default()
            },
            heartbeat: false,
        }
        .normalized();
        assert_eq!(data.summary.overall_progress, 1.0);
        assert_eq!(data.event.unwrap().progress, 0.0);

        let nan = ProgressStreamData {
            summary: ProgressSummary {
                overall_progress: f64::NAN,
                ..Default::default()
            },
            ..Default::default()
        }
        .normalized();
        assert_eq!(nan.summary.overall_progress, 0.0);
    }

    #[test]
    fn test_connection_state_active() {
        assert!(ConnectionState::Connected.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(!ConnectionState::Reconnecting.is_active());
        assert!(!ConnectionState::Failed.is_active());
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_tenant_context_display() {
        assert_eq!(TenantContext::new("cust-1", "proj-9").to_string(), "cust-1/proj-9");
        assert_eq!(TenantContext::default().to_string(), "-/-");
        assert!(TenantContext::default().is_empty());
    }
}
