use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::GuildId;

use super::{
    shift_index, EntryId, NewPlayer, NewQueueEntry, PlayerId, PlayerPatch, PlayerState, PlayerStore, QueueEntry,
};

/// Store kept entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    players: DashMap<PlayerId, PlayerState>,
    entries: DashMap<EntryId, QueueEntry>,
    next_entry: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlayerStore for MemoryStore {
    async fn find_player(&self, guild_id: GuildId) -> Result<Option<PlayerState>> {
        Ok(self.players.get(&PlayerId::from(guild_id)).map(|p| p.clone()))
    }

    async fn create_player(&self, player: NewPlayer) -> Result<PlayerState> {
        let player = PlayerState::new(player);
        self.players.insert(player.id, player.clone());
        Ok(player)
    }

    async fn update_player(&self, id: PlayerId, patch: PlayerPatch) -> Result<PlayerState> {
        let mut player = self
            .players
            .get_mut(&id)
            .ok_or_else(|| anyhow!("player {id} not found"))?;
        player.apply(patch);
        Ok(player.clone())
    }

    async fn delete_player(&self, id: PlayerId) -> Result<()> {
        self.players.remove(&id);
        self.entries.retain(|_, entry| entry.player_id != id);
        Ok(())
    }

    async fn list_players(&self) -> Result<Vec<PlayerState>> {
        Ok(self.players.iter().map(|p| p.value().clone()).collect())
    }

    async fn find_queue(&self, player_id: PlayerId) -> Result<Vec<QueueEntry>> {
        let mut queue: Vec<QueueEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.player_id == player_id)
            .map(|entry| entry.value().clone())
            .collect();
        queue.sort_by_key(|entry| (entry.index, entry.id));
        Ok(queue)
    }

    async fn delete_queue_entry(&self, id: EntryId) -> Result<()> {
        self.entries.remove(&id);
        Ok(())
    }

    async fn renumber_queue_entries(&self, ids: &[EntryId], delta: i64) -> Result<()> {
        for id in ids {
            if let Some(mut entry) = self.entries.get_mut(id) {
                entry.index = shift_index(entry.index, delta);
            }
        }
        Ok(())
    }

    async fn create_queue_entries(&self, entries: Vec<NewQueueEntry>) -> Result<Vec<QueueEntry>> {
        let created: Vec<QueueEntry> = entries
            .into_iter()
            .map(|entry| {
                let id = EntryId(self.next_entry.fetch_add(1, Ordering::SeqCst));
                QueueEntry::new(id, entry)
            })
            .collect();
        for entry in &created {
            self.entries.insert(entry.id, entry.clone());
        }
        Ok(created)
    }
}
