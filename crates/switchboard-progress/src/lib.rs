//! switchboard-progress: resilient progress streams for long-running tasks
//!
//! A [`ProgressStreamClient`] keeps at most one stream per task id, forwards
//! progress updates, reconnects with bounded exponential backoff, and ends
//! every stream with exactly one terminal item.

pub mod backoff;
pub mod client;
pub mod frame;
pub mod source;

pub use backoff::ReconnectPolicy;
pub use client::{ProgressStream, ProgressStreamClient, StreamItem};
pub use frame::{FrameDecoder, ProgressFrame};
pub use source::{FrameStream, HttpProgressSource, ProgressSource};
