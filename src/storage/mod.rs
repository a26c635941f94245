//! # Storage
//!
//! Persisted player rows and queues. The playback core only talks to
//! [`PlayerStore`]; every call is atomic on its own and callers never rely
//! on isolation across calls.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryStore`] - dashmap-backed, used in tests and ephemeral deployments
//! - [`JsonStore`] - one JSON document per guild under `DATA_DIR/players`

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};

use crate::node::protocol::TrackInfo;
use crate::node::NodeId;

mod json;
mod memory;

pub use json::JsonStore;
pub use memory::MemoryStore;

/// One player per guild; the id is the guild snowflake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u64);

impl From<GuildId> for PlayerId {
    fn from(guild_id: GuildId) -> Self {
        PlayerId(guild_id.get())
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStatus {
    Idle,
    Playing,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub id: PlayerId,
    pub guild_id: GuildId,
    pub voice_channel_id: ChannelId,
    pub text_channel_id: Option<ChannelId>,
    /// Index of the current queue entry.
    pub index: u32,
    pub status: PlayerStatus,
    pub track_repeat: bool,
    pub queue_repeat: bool,
    pub volume: u16,
    pub node_id: Option<NodeId>,
    /// Last position reported by the node, in milliseconds.
    pub position: u64,
    pub idle_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PlayerState {
    fn new(player: NewPlayer) -> Self {
        Self {
            id: PlayerId::from(player.guild_id),
            guild_id: player.guild_id,
            voice_channel_id: player.voice_channel_id,
            text_channel_id: player.text_channel_id,
            index: 0,
            status: PlayerStatus::Idle,
            track_repeat: false,
            queue_repeat: false,
            volume: player.volume,
            node_id: None,
            position: 0,
            idle_since: Some(Utc::now()),
            created_at: Utc::now(),
        }
    }

    pub fn apply(&mut self, patch: PlayerPatch) {
        if let Some(index) = patch.index {
            self.index = index;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(track_repeat) = patch.track_repeat {
            self.track_repeat = track_repeat;
        }
        if let Some(queue_repeat) = patch.queue_repeat {
            self.queue_repeat = queue_repeat;
        }
        if let Some(volume) = patch.volume {
            self.volume = volume;
        }
        if let Some(node_id) = patch.node_id {
            self.node_id = node_id;
        }
        if let Some(voice_channel_id) = patch.voice_channel_id {
            self.voice_channel_id = voice_channel_id;
        }
        if let Some(text_channel_id) = patch.text_channel_id {
            self.text_channel_id = text_channel_id;
        }
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(idle_since) = patch.idle_since {
            self.idle_since = idle_since;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPlayer {
    pub guild_id: GuildId,
    pub voice_channel_id: ChannelId,
    pub text_channel_id: Option<ChannelId>,
    pub volume: u16,
}

/// Partial update. `None` leaves a field untouched; nullable fields use a
/// nested `Option` so they can be cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerPatch {
    pub index: Option<u32>,
    pub status: Option<PlayerStatus>,
    pub track_repeat: Option<bool>,
    pub queue_repeat: Option<bool>,
    pub volume: Option<u16>,
    pub node_id: Option<Option<NodeId>>,
    pub voice_channel_id: Option<ChannelId>,
    pub text_channel_id: Option<Option<ChannelId>>,
    pub position: Option<u64>,
    pub idle_since: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: EntryId,
    pub player_id: PlayerId,
    pub index: u32,
    /// Opaque backend blob, stored and forwarded untouched.
    pub track: String,
    pub info: TrackInfo,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueEntry {
    pub player_id: PlayerId,
    pub index: u32,
    pub track: String,
    pub info: TrackInfo,
}

impl QueueEntry {
    fn new(id: EntryId, entry: NewQueueEntry) -> Self {
        Self {
            id,
            player_id: entry.player_id,
            index: entry.index,
            track: entry.track,
            info: entry.info,
            added_at: Utc::now(),
        }
    }
}

fn shift_index(index: u32, delta: i64) -> u32 {
    (i64::from(index) + delta).clamp(0, i64::from(u32::MAX)) as u32
}

#[async_trait]
pub trait PlayerStore: Send + Sync {
    async fn find_player(&self, guild_id: GuildId) -> Result<Option<PlayerState>>;

    async fn create_player(&self, player: NewPlayer) -> Result<PlayerState>;

    /// Applies `patch` and returns the updated row. Fails if the player does not exist.
    async fn update_player(&self, id: PlayerId, patch: PlayerPatch) -> Result<PlayerState>;

    /// Deletes the player and its whole queue.
    async fn delete_player(&self, id: PlayerId) -> Result<()>;

    async fn list_players(&self) -> Result<Vec<PlayerState>>;

    /// Entries ordered by index.
    async fn find_queue(&self, player_id: PlayerId) -> Result<Vec<QueueEntry>>;

    async fn delete_queue_entry(&self, id: EntryId) -> Result<()>;

    /// Adds `delta` to the index of every listed entry.
    async fn renumber_queue_entries(&self, ids: &[EntryId], delta: i64) -> Result<()>;

    async fn create_queue_entries(&self, entries: Vec<NewQueueEntry>) -> Result<Vec<QueueEntry>>;
}
