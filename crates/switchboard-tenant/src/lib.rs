//! switchboard-tenant: keeps the selected customer/project in step across
//! processes that share one persisted record

pub mod broadcaster;
pub mod store;

pub use broadcaster::{ChangeOrigin, Committed, ContextChange, TenantBroadcaster};
pub use store::{ContextStore, StoredRecord};
