//! switchboard-gateway: the room-facing half of switchboard
//!
//! Provides one WebSocket transport channel per room, a command router that
//! holds commands until a handler for their action exists, the built-in tool
//! handlers, and an emitter for correlated tool events.

pub mod emitter;
pub mod protocol;
pub mod rooms;
pub mod router;
pub mod tools;
pub mod transport;

pub use emitter::{EventEmitter, ToolEventDraft};
pub use protocol::{ChatMessage, Participant, RoomEnvelope};
pub use rooms::RoomChannels;
pub use router::{CommandHandler, CommandRouter, RouterAttachment, handler_fn};
pub use tools::{ToolContext, ToolIntentStore, register_builtin_handlers};
pub use transport::{Delivery, TransportChannel};
