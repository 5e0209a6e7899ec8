//! Room channel registry: at most one transport channel per room
//!
//! Channels are created on first use and destroyed on teardown. Asking for a
//! room that already has a channel returns the same channel, so reconnecting
//! reuses it rather than opening a second connection.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use switchboard_core::{ConnectionState, Error, Result};

use crate::transport::TransportChannel;

const MAX_ROOM_ID_LEN: usize = 128;

/// Maximum number of rooms held open at once
const MAX_ROOMS: usize = 256;

/// Room ids are substituted into the endpoint URL, so they are limited to
/// one path segment of `[a-z0-9_:-]`. Case and surrounding whitespace are
/// ignored.
fn room_key(room_id: &str) -> Result<String> {
    let key = room_id.trim().to_ascii_lowercase();
    let problem = if key.is_empty() {
        Some("empty")
    } else if key.len() > MAX_ROOM_ID_LEN {
        Some("longer than 128 bytes")
    } else if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
    {
        Some("only letters, digits, '-', '_' and ':' are allowed")
    } else {
        None
    };
    match problem {
        Some(problem) => Err(Error::Config(format!(
            "invalid room id '{}': {}",
            room_id, problem
        ))),
        None => Ok(key),
    }
}

/// Owns the transport channel of every open room
#[derive(Clone, Default)]
pub struct RoomChannels {
    channels: Arc<RwLock<HashMap<String, TransportChannel>>>,
}

impl RoomChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// The channel for a room, created on first use
    pub async fn channel(&self, room_id: &str) -> Result<TransportChannel> {
        let room = room_key(room_id)?;

        if let Some(existing) = self.channels.read().await.get(&room) {
            return Ok(existing.clone());
        }

        let mut channels = self.channels.write().await;
        if let Some(existing) = channels.get(&room) {
            return Ok(existing.clone());
        }
        if channels.len() >= MAX_ROOMS {
            return Err(Error::Config("Maximum number of rooms reached".to_string()));
        }

        let channel = TransportChannel::new(room.clone());
        channels.insert(room.clone(), channel.clone());
        debug!("Created channel for room '{}'", room);
        Ok(channel)
    }

    /// Existing channel for a room, without creating one
    pub async fn get(&self, room_id: &str) -> Option<TransportChannel> {
        let room = match room_key(room_id) {
            Ok(room) => room,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        self.channels.read().await.get(&room).cloned()
    }

    /// Tear a room down: disconnect its channel and forget it
    pub async fn close(&self, room_id: &str) -> bool {
        let Ok(room) = room_key(room_id) else {
            return false;
        };
        let removed = self.channels.write().await.remove(&room);
        match removed {
            Some(channel) => {
                channel.disconnect();
                info!("Closed room '{}'", room);
                true
            }
            None => false,
        }
    }

    /// Tear every room down
    pub async fn close_all(&self) {
        let drained: Vec<(String, TransportChannel)> =
            self.channels.write().await.drain().collect();
        for (room, channel) in drained {
            channel.disconnect();
            debug!("Closed room '{}'", room);
        }
    }

    /// Open rooms and their connection state, sorted by room id
    pub async fn list(&self) -> Vec<(String, ConnectionState)> {
        let channels = self.channels.read().await;
        let mut list: Vec<(String, ConnectionState)> = channels
            .iter()
            .map(|(room, channel)| (room.clone(), channel.state()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    pub async fn count(&self) -> usize {
        self.channels.read().await.len()
    }
}
