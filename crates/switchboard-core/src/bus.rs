//! Typed in-process notification bus
//!
//! Command handlers publish here instead of calling into the UI module that
//! owns a tool. Each topic carries its own payload shape and has exactly one
//! owning consumer, but any number of observers may subscribe.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default capacity of the bus' broadcast ring
const BUS_CAPACITY: usize = 256;

/// Payload of a `task-create` notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

/// A decoupling notification: topic plus typed detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "detail", rename_all = "kebab-case")]
pub enum Notification {
    TabSwitch {
        tab: String,
    },
    OverlayToggle {
        overlay: String,
        visible: Option<bool>,
    },
    TaskCreate(TaskDraft),
    TaskStatusUpdate {
        task_id: String,
        status: String,
    },
    ConstraintValidate {
        target: String,
        rules: Vec<String>,
    },
    FileOpenByPattern {
        pattern: String,
    },
    SearchAndReplace {
        search: String,
        replace: String,
        file_pattern: Option<String>,
    },
    MetricFocus {
        metric: String,
        time_range: Option<String>,
    },
    MetricsExport {
        format: String,
        metrics: Vec<String>,
    },
}

/// Topic names, one per [`Notification`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    TabSwitch,
    OverlayToggle,
    TaskCreate,
    TaskStatusUpdate,
    ConstraintValidate,
    FileOpenByPattern,
    SearchAndReplace,
    MetricFocus,
    MetricsExport,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::TabSwitch => "tab-switch",
            Topic::OverlayToggle => "overlay-toggle",
            Topic::TaskCreate => "task-create",
            Topic::TaskStatusUpdate => "task-status-update",
            Topic::ConstraintValidate => "constraint-validate",
            Topic::FileOpenByPattern => "file-open-by-pattern",
            Topic::SearchAndReplace => "search-and-replace",
            Topic::MetricFocus => "metric-focus",
            Topic::MetricsExport => "metrics-export",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Notification {
    pub fn topic(&self) -> Topic {
        match self {
            Notification::TabSwitch { .. } => Topic::TabSwitch,
            Notification::OverlayToggle { .. } => Topic::OverlayToggle,
            Notification::TaskCreate(_) => Topic::TaskCreate,
            Notification::TaskStatusUpdate { .. } => Topic::TaskStatusUpdate,
            Notification::ConstraintValidate { .. } => Topic::ConstraintValidate,
            Notification::FileOpenByPattern { .. } => Topic::FileOpenByPattern,
            Notification::SearchAndReplace { .. } => Topic::SearchAndReplace,
            Notification::MetricFocus { .. } => Topic::MetricFocus,
            Notification::MetricsExport { .. } => Topic::MetricsExport,
        }
    }
}

/// Publish/subscribe hub for [`Notification`]s. Clones share the same hub.
#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish a notification, returning how many subscribers received it
    pub fn publish(&self, notification: Notification) -> usize {
        let topic = notification.topic();
        match self.tx.send(notification) {
            Ok(receivers) => {
                debug!("Published {} to {} subscriber(s)", topic, receivers);
                receivers
            }
            Err(_) => {
                debug!("Published {} with no subscribers", topic);
                0
            }
        }
    }

    /// Subscribe to a set of topics
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: Some(topics.to_vec()),
        }
    }

    /// Subscribe to every topic
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            topics: None,
        }
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A topic-filtered receiver on a [`NotificationBus`]
pub struct Subscription {
    rx: broadcast::Receiver<Notification>,
    topics: Option<Vec<Topic>>,
}

impl Subscription {
    fn wants(&self, notification: &Notification) -> bool {
        match &self.topics {
            Some(topics) => topics.contains(&notification.topic()),
            None => true,
        }
    }

    /// Wait for the next matching notification; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(n) if self.wants(&n) => return Some(n),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Notification subscriber lagged, skipped {} message(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching notification already queued, without waiting
    pub fn try_recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.try_recv() {
                Ok(n) if self.wants(&n) => return Some(n),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Notification subscriber lagged, skipped {} message(s)", skipped);
                }
                Err(_) => return None,
            }
        }
    }
}
