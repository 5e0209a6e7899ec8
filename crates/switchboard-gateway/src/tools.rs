//! Built-in tool command catalog
//!
//! Every built-in handler does the same three things for its action:
//! record the tool's latest intent, publish a typed notification for the
//! UI module that owns the tool, and acknowledge the command with a
//! correlated tool event.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use switchboard_core::bus::TaskDraft;
use switchboard_core::{
    Command, Error, Notification, NotificationBus, Result, ToolEventType, ToolType,
};

use crate::emitter::{EventEmitter, ToolEventDraft};
use crate::router::{CommandHandler, CommandRouter};

/// The most recent command a tool was asked to carry out
#[derive(Debug, Clone, Serialize)]
pub struct ToolIntent {
    pub action: String,
    pub parameters: Map<String, Value>,
    pub at: DateTime<Utc>,
}

/// Latest intent per tool, readable by whatever renders the tools
#[derive(Default)]
pub struct ToolIntentStore {
    intents: RwLock<HashMap<ToolType, ToolIntent>>,
}

impl ToolIntentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, tool: ToolType, command: &Command) {
        let intent = ToolIntent {
            action: command.action.clone(),
            parameters: command.parameters.clone(),
            at: Utc::now(),
        };
        self.intents.write().await.insert(tool, intent);
    }

    pub async fn get(&self, tool: ToolType) -> Option<ToolIntent> {
        self.intents.read().await.get(&tool).cloned()
    }

    pub async fn len(&self) -> usize {
        self.intents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.intents.read().await.is_empty()
    }
}

// ── Parameter helpers ──

fn required_str(command: &Command, key: &str) -> Result<String> {
    command
        .param_str(key)
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::handler(&command.action, format!("missing '{}' parameter", key)))
}

fn optional_str(command: &Command, key: &str) -> Option<String> {
    command.param_str(key).map(str::to_string)
}

fn str_list(command: &Command, key: &str) -> Vec<String> {
    match command.parameters.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(single)) => vec![single.clone()],
        _ => Vec::new(),
    }
}

// ── Catalog ──

/// One row of the built-in catalog
pub struct BuiltinTool {
    pub action: &'static str,
    pub description: &'static str,
    pub tool_type: ToolType,
    pub event_type: ToolEventType,
    build: fn(&Command) -> Result<Notification>,
}

fn open_panel(cmd: &Command) -> Result<Notification> {
    Ok(Notification::TabSwitch {
        tab: required_str(cmd, "panel")?,
    })
}

fn toggle_overlay(cmd: &Command) -> Result<Notification> {
    Ok(Notification::OverlayToggle {
        overlay: required_str(cmd, "overlay")?,
        visible: cmd.parameters.get("visible").and_then(|v| v.as_bool()),
    })
}

fn run_validation(cmd: &Command) -> Result<Notification> {
    Ok(Notification::ConstraintValidate {
        target: required_str(cmd, "target")?,
        rules: str_list(cmd, "rules"),
    })
}

fn create_task(cmd: &Command) -> Result<Notification> {
    Ok(Notification::TaskCreate(TaskDraft {
        title: required_str(cmd, "title")?,
        description: optional_str(cmd, "description"),
        priority: optional_str(cmd, "priority"),
        assignee: optional_str(cmd, "assignee"),
    }))
}

fn update_task_status(cmd: &Command) -> Result<Notification> {
    Ok(Notification::TaskStatusUpdate {
        task_id: required_str(cmd, "task_id")?,
        status: required_str(cmd, "status")?,
    })
}

fn open_file(cmd: &Command) -> Result<Notification> {
    Ok(Notification::FileOpenByPattern {
        pattern: required_str(cmd, "pattern")?,
    })
}

fn search_replace(cmd: &Command) -> Result<Notification> {
    Ok(Notification::SearchAndReplace {
        search: required_str(cmd, "search")?,
        // Replacing with nothing is a deletion, so empty is allowed here
        replace: optional_str(cmd, "replace").unwrap_or_default(),
        file_pattern: optional_str(cmd, "file_pattern"),
    })
}

fn focus_metric(cmd: &Command) -> Result<Notification> {
    Ok(Notification::MetricFocus {
        metric: required_str(cmd, "metric")?,
        time_range: optional_str(cmd, "time_range"),
    })
}

fn export_data(cmd: &Command) -> Result<Notification> {
    Ok(Notification::MetricsExport {
        format: optional_str(cmd, "format").unwrap_or_else(|| "csv".to_string()),
        metrics: str_list(cmd, "metrics"),
    })
}

pub const BUILTIN_TOOLS: &[BuiltinTool] = &[
    BuiltinTool {
        action: "open_panel",
        description: "Switch the workspace to a named panel",
        tool_type: ToolType::Workspace,
        event_type: ToolEventType::StateChanged,
        build: open_panel,
    },
    BuiltinTool {
        action: "toggle_overlay",
        description: "Show or hide a workspace overlay",
        tool_type: ToolType::Workspace,
        event_type: ToolEventType::StateChanged,
        build: toggle_overlay,
    },
    BuiltinTool {
        action: "run_validation",
        description: "Run the security validator against a target",
        tool_type: ToolType::SecurityValidator,
        event_type: ToolEventType::ActionPerformed,
        build: run_validation,
    },
    BuiltinTool {
        action: "create_task",
        description: "Create a task in the task planner",
        tool_type: ToolType::TaskPlanner,
        event_type: ToolEventType::DataChanged,
        build: create_task,
    },
    BuiltinTool {
        action: "update_task_status",
        description: "Move a planner task to a new status",
        tool_type: ToolType::TaskPlanner,
        event_type: ToolEventType::DataChanged,
        build: update_task_status,
    },
    BuiltinTool {
        action: "open_file",
        description: "Open files matching a pattern in the code editor",
        tool_type: ToolType::CodeEditor,
        event_type: ToolEventType::StateChanged,
        build: open_file,
    },
    BuiltinTool {
        action: "search_replace",
        description: "Search and replace across editor files",
        tool_type: ToolType::CodeEditor,
        event_type: ToolEventType::DataChanged,
        build: search_replace,
    },
    BuiltinTool {
        action: "focus_metric",
        description: "Focus a metric on the dashboard",
        tool_type: ToolType::MetricsDashboard,
        event_type: ToolEventType::StateChanged,
        build: focus_metric,
    },
    BuiltinTool {
        action: "export_data",
        description: "Export dashboard metrics",
        tool_type: ToolType::MetricsDashboard,
        event_type: ToolEventType::ActionPerformed,
        build: export_data,
    },
];

/// Look up a catalog row
pub fn builtin(action: &str) -> Option<&'static BuiltinTool> {
    BUILTIN_TOOLS.iter().find(|t| t.action == action)
}

/// Shared collaborators of the built-in handlers
#[derive(Clone)]
pub struct ToolContext {
    pub intents: Arc<ToolIntentStore>,
    pub bus: NotificationBus,
    pub emitter: EventEmitter,
}

/// Handler for one catalog row
pub struct BuiltinHandler {
    tool: &'static BuiltinTool,
    ctx: ToolContext,
}

impl BuiltinHandler {
    pub fn new(tool: &'static BuiltinTool, ctx: ToolContext) -> Self {
        Self { tool, ctx }
    }
}

#[async_trait]
impl CommandHandler for BuiltinHandler {
    async fn handle(&self, command: &Command) -> Result<()> {
        let notification = (self.tool.build)(command)?;
        let detail = serde_json::to_value(&notification)?
            .get("detail")
            .cloned()
            .unwrap_or(Value::Null);

        self.ctx.intents.record(self.tool.tool_type, command).await;
        let receivers = self.ctx.bus.publish(notification);
        debug!(
            "'{}' notified {} subscriber(s)",
            self.tool.action, receivers
        );

        let draft = ToolEventDraft::new(self.tool.tool_type, self.tool.event_type)
            .with("action", self.tool.action)
            .with("detail", detail)
            .in_reply_to(command);
        self.ctx.emitter.send_tool_event(draft);
        Ok(())
    }
}

/// Register the whole catalog on a router
pub async fn register_builtin_handlers(router: &CommandRouter, ctx: &ToolContext) {
    for tool in BUILTIN_TOOLS {
        router
            .register_handler(tool.action, Arc::new(BuiltinHandler::new(tool, ctx.clone())))
            .await;
    }
    info!("Registered {} built-in tool handlers", BUILTIN_TOOLS.len());
}
