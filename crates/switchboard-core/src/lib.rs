//! switchboard-core: shared building blocks for the coordination layer
//!
//! This crate provides:
//! - The wire/data model (commands, tool events, progress, tenant context)
//! - The error taxonomy shared by every switchboard crate
//! - A typed in-process notification bus that decouples command handlers
//!   from the UI modules that react to them
//! - TOML configuration with defaults

pub mod bus;
pub mod config;
pub mod error;
pub mod model;

pub use bus::{Notification, NotificationBus, Subscription, Topic};
pub use config::SwitchboardConfig;
pub use error::{Error, Result};
pub use model::{
    Command, ConnectionState, ProgressEvent, ProgressStage, ProgressStreamData, ProgressSummary,
    TenantContext, ToolEvent, ToolEventType, ToolType,
};
