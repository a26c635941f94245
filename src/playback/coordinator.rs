//! # Playback Coordinator
//!
//! Turns node track events into queue movement and persists the result.
//!
//! ## Track end
//!
//! | reason        | effect                                                     |
//! |---------------|------------------------------------------------------------|
//! | `REPLACED`    | nothing besides clearing an armed track repeat             |
//! | `FINISHED`    | replay when track repeat is on, otherwise advance          |
//! | `LOAD_FAILED` | drop the entry, shift later entries down, play what moved in |
//! | other         | advance                                                    |
//!
//! Past the end of the queue the index wraps to 0 when queue repeat is on;
//! otherwise the player goes idle and records `idle_since`.
//!
//! Exceptions and stuck tracks are only published. The queue moves solely on
//! a `TrackEnd` from the node.
//!
//! Every mutating operation holds a per-guild lock so a track end and an
//! explicit command for the same guild never interleave.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serenity::model::id::GuildId;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::events::PlaybackEvent;
use crate::error::{Error, Result};
use crate::node::protocol::{
    Command, Event, Filters, LoadedTrack, PlayerUpdate, TrackEnd, TrackEndReason, TrackStart,
};
use crate::node::AudioNode;
use crate::storage::{
    EntryId, NewQueueEntry, PlayerPatch, PlayerState, PlayerStatus, PlayerStore, QueueEntry,
};

/// Highest volume the node accepts.
pub const MAX_VOLUME: u16 = 1000;

pub struct PlaybackCoordinator {
    store: Arc<dyn PlayerStore>,
    events: broadcast::Sender<PlaybackEvent>,
    locks: DashMap<GuildId, Arc<Mutex<()>>>,
}

impl PlaybackCoordinator {
    pub fn new(store: Arc<dyn PlayerStore>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            events,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PlayerStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    fn guild_lock(&self, guild_id: GuildId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(guild_id).or_default().value())
    }

    pub fn forget(&self, guild_id: GuildId) {
        self.locks.remove(&guild_id);
    }

    fn emit(&self, event: PlaybackEvent) {
        // Sin suscriptores no es un error
        let _ = self.events.send(event);
    }

    async fn player(&self, guild_id: GuildId) -> Result<PlayerState> {
        self.store
            .find_player(guild_id)
            .await?
            .ok_or(Error::NoPlayer(guild_id))
    }

    /// Dispatches one node event for a guild.
    pub async fn handle_event(&self, node: &Arc<dyn AudioNode>, event: Event) -> Result<()> {
        match event {
            Event::TrackStart(start) => self.on_track_start(node, start).await,
            Event::TrackEnd(end) => self.on_track_end(node, end).await,
            Event::TrackException(exception) => {
                warn!(
                    guild_id = %exception.guild_id,
                    node_id = %node.id(),
                    "⚠️ Excepción en '{}': {:?}",
                    exception.info.title,
                    exception.exception.as_ref().and_then(|e| e.message.as_deref()).or(exception.error.as_deref())
                );
                self.emit(PlaybackEvent::TrackException {
                    node: node.id(),
                    payload: exception,
                });
                Ok(())
            }
            Event::TrackStuck(stuck) => {
                warn!(
                    guild_id = %stuck.guild_id,
                    node_id = %node.id(),
                    "⏳ Track atascado '{}' ({}ms)",
                    stuck.info.title,
                    stuck.threshold_ms
                );
                self.emit(PlaybackEvent::TrackStuck {
                    node: node.id(),
                    payload: stuck,
                });
                Ok(())
            }
            Event::PlayerUpdate(update) => self.on_player_update(update).await,
            Event::WebSocketClosed(_) | Event::WebSocketReady(_) => Ok(()),
        }
    }

    /// The node plays a track for a guild we no longer track.
    async fn destroy_orphan(&self, node: &Arc<dyn AudioNode>, guild_id: GuildId) -> Result<()> {
        info!(guild_id = %guild_id, node_id = %node.id(), "🧹 Reproductor huérfano, destruyendo en el nodo");
        node.send(Command::Destroy { guild_id }).await
    }

    pub async fn on_track_start(&self, node: &Arc<dyn AudioNode>, start: TrackStart) -> Result<()> {
        let guild_id = start.guild_id;
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let Some(player) = self.store.find_player(guild_id).await? else {
            return self.destroy_orphan(node, guild_id).await;
        };

        info!(guild_id = %guild_id, "🎵 Reproduciendo '{}' de {}", start.info.title, start.info.author);
        if player.status == PlayerStatus::Idle {
            self.store
                .update_player(
                    player.id,
                    PlayerPatch {
                        status: Some(PlayerStatus::Playing),
                        idle_since: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
        }

        self.emit(PlaybackEvent::TrackStart {
            node: node.id(),
            payload: start,
        });
        Ok(())
    }

    pub async fn on_track_end(&self, node: &Arc<dyn AudioNode>, end: TrackEnd) -> Result<()> {
        let guild_id = end.guild_id;
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let Some(player) = self.store.find_player(guild_id).await? else {
            return self.destroy_orphan(node, guild_id).await;
        };
        debug!(guild_id = %guild_id, reason = ?end.reason, index = player.index, "Track terminado");

        let reason = end.reason;
        let replay = end.track.clone();
        self.emit(PlaybackEvent::TrackEnd {
            node: node.id(),
            payload: end,
        });

        let mut patch = PlayerPatch::default();
        let mut track_repeat = player.track_repeat;
        if reason != TrackEndReason::Finished && track_repeat {
            patch.track_repeat = Some(false);
            track_repeat = false;
        }

        if reason == TrackEndReason::Replaced {
            if patch != PlayerPatch::default() {
                self.store.update_player(player.id, patch).await?;
            }
            return Ok(());
        }

        if reason == TrackEndReason::Finished && track_repeat {
            self.play(node, &player, &replay, 0).await?;
            return Ok(());
        }

        let mut index = player.index;
        let mut queue = self.store.find_queue(player.id).await?;

        if reason == TrackEndReason::LoadFailed {
            if let Some(failed) = queue.iter().find(|entry| entry.index == index) {
                warn!(guild_id = %guild_id, "❌ No se pudo cargar '{}', se quita de la cola", failed.info.title);
                self.store.delete_queue_entry(failed.id).await?;
                let later: Vec<EntryId> = queue
                    .iter()
                    .filter(|entry| entry.index > index)
                    .map(|entry| entry.id)
                    .collect();
                if !later.is_empty() {
                    self.store.renumber_queue_entries(&later, -1).await?;
                }
                queue = self.store.find_queue(player.id).await?;
            }
        } else {
            index += 1;
        }

        if let Some(next) = entry_at(&queue, index) {
            return self.start_entry(node, &player, next, patch).await;
        }

        if player.queue_repeat {
            if let Some(first) = entry_at(&queue, 0) {
                debug!(guild_id = %guild_id, "🔁 Cola repetida desde el inicio");
                return self.start_entry(node, &player, first, patch).await;
            }
        }

        info!(guild_id = %guild_id, "⏹️ Cola terminada, reproductor inactivo");
        patch.index = Some(if player.queue_repeat { 0 } else { index });
        patch.status = Some(PlayerStatus::Idle);
        patch.idle_since = Some(Some(Utc::now()));
        patch.position = Some(0);
        self.store.update_player(player.id, patch).await?;
        Ok(())
    }

    pub async fn on_player_update(&self, update: PlayerUpdate) -> Result<()> {
        let Some(player) = self.store.find_player(update.guild_id).await? else {
            return Ok(());
        };

        let patch = PlayerPatch {
            position: update.state.position,
            volume: update.state.volume,
            ..Default::default()
        };
        if patch != PlayerPatch::default() {
            self.store.update_player(player.id, patch).await?;
        }
        Ok(())
    }

    /// Re-issues `play` and `volume` from persisted state. Returns whether
    /// anything was sent.
    pub async fn restore(&self, guild_id: GuildId, node: &Arc<dyn AudioNode>) -> Result<bool> {
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let Some(player) = self.store.find_player(guild_id).await? else {
            return Ok(false);
        };
        if player.status == PlayerStatus::Idle {
            return Ok(false);
        }

        let queue = self.store.find_queue(player.id).await?;
        let Some(current) = entry_at(&queue, player.index) else {
            return Ok(false);
        };

        info!(
            guild_id = %guild_id,
            node_id = %node.id(),
            "♻️ Restaurando '{}' en {}ms",
            current.info.title,
            player.position
        );
        node.send(Command::Play {
            guild_id,
            track: current.track.clone(),
            start_time: player.position,
            volume: None,
            pause: player.status == PlayerStatus::Paused,
        })
        .await?;
        node.send(Command::Volume {
            guild_id,
            volume: player.volume,
        })
        .await?;
        Ok(true)
    }

    /// Appends tracks after the last queued entry. An idle player starts
    /// playing the first appended track, or the current entry if one exists.
    pub async fn enqueue(
        &self,
        node: &Arc<dyn AudioNode>,
        guild_id: GuildId,
        tracks: Vec<LoadedTrack>,
    ) -> Result<Vec<QueueEntry>> {
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let player = self.player(guild_id).await?;
        let queue = self.store.find_queue(player.id).await?;
        let next_index = queue.iter().map(|entry| entry.index + 1).max().unwrap_or(0);

        let entries = tracks
            .into_iter()
            .enumerate()
            .map(|(offset, loaded)| NewQueueEntry {
                player_id: player.id,
                index: next_index + offset as u32,
                track: loaded.track,
                info: loaded.info,
            })
            .collect();
        let created = self.store.create_queue_entries(entries).await?;
        info!(guild_id = %guild_id, "➕ {} tracks agregados a la cola", created.len());

        if player.status == PlayerStatus::Idle {
            let start = entry_at(&queue, player.index).or_else(|| created.first());
            if let Some(entry) = start {
                self.start_entry(node, &player, entry, PlayerPatch::default()).await?;
            }
        }
        Ok(created)
    }

    /// Stops the current track; the resulting `TrackEnd` advances the queue.
    pub async fn skip(&self, node: &Arc<dyn AudioNode>, guild_id: GuildId) -> Result<()> {
        self.player(guild_id).await?;
        node.send(Command::Stop { guild_id }).await
    }

    pub async fn pause(&self, node: &Arc<dyn AudioNode>, guild_id: GuildId, pause: bool) -> Result<()> {
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let player = self.player(guild_id).await?;
        node.send(Command::Pause { guild_id, pause }).await?;
        if player.status != PlayerStatus::Idle {
            let status = if pause { PlayerStatus::Paused } else { PlayerStatus::Playing };
            self.store
                .update_player(
                    player.id,
                    PlayerPatch {
                        status: Some(status),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    pub async fn seek(&self, node: &Arc<dyn AudioNode>, guild_id: GuildId, position: u64) -> Result<()> {
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let player = self.player(guild_id).await?;
        node.send(Command::Seek { guild_id, position }).await?;
        self.store
            .update_player(
                player.id,
                PlayerPatch {
                    position: Some(position),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Persists first so a restore after a crash uses the new volume.
    pub async fn set_volume(&self, node: &Arc<dyn AudioNode>, guild_id: GuildId, volume: u16) -> Result<u16> {
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let volume = volume.min(MAX_VOLUME);
        let player = self.player(guild_id).await?;
        self.store
            .update_player(
                player.id,
                PlayerPatch {
                    volume: Some(volume),
                    ..Default::default()
                },
            )
            .await?;
        node.send(Command::Volume { guild_id, volume }).await?;
        Ok(volume)
    }

    pub async fn set_track_repeat(&self, guild_id: GuildId, enabled: bool) -> Result<()> {
        self.set_flags(
            guild_id,
            PlayerPatch {
                track_repeat: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn set_queue_repeat(&self, guild_id: GuildId, enabled: bool) -> Result<()> {
        self.set_flags(
            guild_id,
            PlayerPatch {
                queue_repeat: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    async fn set_flags(&self, guild_id: GuildId, patch: PlayerPatch) -> Result<()> {
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let player = self.player(guild_id).await?;
        self.store.update_player(player.id, patch).await?;
        Ok(())
    }

    /// Clears the queue and leaves the player idle at index 0.
    pub async fn stop(&self, node: &Arc<dyn AudioNode>, guild_id: GuildId) -> Result<()> {
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let player = self.player(guild_id).await?;
        for entry in self.store.find_queue(player.id).await? {
            self.store.delete_queue_entry(entry.id).await?;
        }
        self.store
            .update_player(
                player.id,
                PlayerPatch {
                    index: Some(0),
                    status: Some(PlayerStatus::Idle),
                    track_repeat: Some(false),
                    position: Some(0),
                    idle_since: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        node.send(Command::Stop { guild_id }).await?;
        info!(guild_id = %guild_id, "⏹️ Reproducción detenida y cola vaciada");
        Ok(())
    }

    pub async fn filters(&self, node: &Arc<dyn AudioNode>, filters: Filters) -> Result<()> {
        self.player(filters.guild_id).await?;
        node.send(Command::Filters(filters)).await
    }

    /// Deletes the persisted player and tells the node to drop it.
    pub async fn destroy(&self, guild_id: GuildId, node: Option<&Arc<dyn AudioNode>>) -> Result<()> {
        {
            let lock = self.guild_lock(guild_id);
            let _guard = lock.lock().await;
            if let Some(player) = self.store.find_player(guild_id).await? {
                self.store.delete_player(player.id).await?;
            }
        }
        self.forget(guild_id);

        if let Some(node) = node {
            node.send(Command::Destroy { guild_id }).await?;
        }
        info!(guild_id = %guild_id, "🗑️ Reproductor destruido");
        Ok(())
    }

    async fn start_entry(
        &self,
        node: &Arc<dyn AudioNode>,
        player: &PlayerState,
        entry: &QueueEntry,
        mut patch: PlayerPatch,
    ) -> Result<()> {
        self.play(node, player, &entry.track, 0).await?;

        patch.index = Some(entry.index);
        patch.status = Some(PlayerStatus::Playing);
        patch.position = Some(0);
        patch.idle_since = Some(None);
        self.store.update_player(player.id, patch).await?;
        Ok(())
    }

    async fn play(&self, node: &Arc<dyn AudioNode>, player: &PlayerState, track: &str, start_time: u64) -> Result<()> {
        node.send(Command::Play {
            guild_id: player.guild_id,
            track: track.to_string(),
            start_time,
            volume: None,
            pause: false,
        })
        .await?;
        node.send(Command::Volume {
            guild_id: player.guild_id,
            volume: player.volume,
        })
        .await
    }
}

fn entry_at(queue: &[QueueEntry], index: u32) -> Option<&QueueEntry> {
    queue.iter().find(|entry| entry.index == index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::protocol::{PlayerUpdateState, TrackException, TrackInfo, TrackStuck};
    use crate::node::testing::FakeNode;
    use crate::storage::{MemoryStore, NewPlayer, PlayerId};
    use pretty_assertions::assert_eq;
    use serenity::model::id::ChannelId;

    const GUILD: u64 = 4242;

    struct Harness {
        coordinator: PlaybackCoordinator,
        store: Arc<MemoryStore>,
        fake: Arc<FakeNode>,
        node: Arc<dyn AudioNode>,
    }

    impl Harness {
        async fn new(tracks: &[&str], index: u32) -> Self {
            let store = Arc::new(MemoryStore::new());
            let fake = Arc::new(FakeNode::new(0, "us", 0));
            let node: Arc<dyn AudioNode> = fake.clone();
            let coordinator = PlaybackCoordinator::new(store.clone());

            let player = store
                .create_player(NewPlayer {
                    guild_id: guild(),
                    voice_channel_id: ChannelId::new(1),
                    text_channel_id: None,
                    volume: 70,
                })
                .await
                .unwrap();
            store
                .create_queue_entries(
                    tracks
                        .iter()
                        .enumerate()
                        .map(|(i, track)| NewQueueEntry {
                            player_id: player.id,
                            index: i as u32,
                            track: track.to_string(),
                            info: TrackInfo::default(),
                        })
                        .collect(),
                )
                .await
                .unwrap();
            store
                .update_player(
                    player.id,
                    PlayerPatch {
                        index: Some(index),
                        status: Some(PlayerStatus::Playing),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();

            Self {
                coordinator,
                store,
                fake,
                node,
            }
        }

        async fn patch(&self, patch: PlayerPatch) {
            self.store.update_player(PlayerId(GUILD), patch).await.unwrap();
        }

        async fn player(&self) -> PlayerState {
            self.store.find_player(guild()).await.unwrap().unwrap()
        }

        async fn layout(&self) -> Vec<(u32, String)> {
            self.store
                .find_queue(PlayerId(GUILD))
                .await
                .unwrap()
                .into_iter()
                .map(|entry| (entry.index, entry.track))
                .collect()
        }

        async fn end(&self, track: &str, reason: TrackEndReason) {
            self.coordinator
                .on_track_end(
                    &self.node,
                    TrackEnd {
                        guild_id: guild(),
                        track: track.to_string(),
                        info: TrackInfo::default(),
                        reason,
                    },
                )
                .await
                .unwrap();
        }

        fn played(&self) -> Vec<String> {
            self.fake
                .sent()
                .into_iter()
                .filter_map(|command| match command {
                    Command::Play { track, .. } => Some(track),
                    _ => None,
                })
                .collect()
        }
    }

    fn guild() -> GuildId {
        GuildId::new(GUILD)
    }

    #[tokio::test]
    async fn finished_with_track_repeat_replays_same_index() {
        let h = Harness::new(&["T0", "T1"], 0).await;
        h.patch(PlayerPatch {
            track_repeat: Some(true),
            ..Default::default()
        })
        .await;

        h.end("T0", TrackEndReason::Finished).await;

        assert_eq!(h.played(), vec!["T0"]);
        assert_eq!(h.fake.ops(), vec!["play", "volume"]);
        let player = h.player().await;
        assert_eq!(player.index, 0);
        assert!(player.track_repeat);
    }

    #[tokio::test]
    async fn load_failed_drops_entry_and_plays_shifted_one() {
        let h = Harness::new(&["T0", "T1", "T2"], 1).await;

        h.end("T1", TrackEndReason::LoadFailed).await;

        assert_eq!(h.layout().await, vec![(0, "T0".to_string()), (1, "T2".to_string())]);
        assert_eq!(h.played(), vec!["T2"]);
        assert_eq!(h.player().await.index, 1);
    }

    #[tokio::test]
    async fn finished_with_queue_repeat_wraps_to_start() {
        let h = Harness::new(&["T0"], 0).await;
        h.patch(PlayerPatch {
            queue_repeat: Some(true),
            ..Default::default()
        })
        .await;

        h.end("T0", TrackEndReason::Finished).await;

        assert_eq!(h.played(), vec!["T0"]);
        let player = h.player().await;
        assert_eq!(player.index, 0);
        assert_eq!(player.status, PlayerStatus::Playing);
    }

    #[tokio::test]
    async fn finished_advances_to_next_entry() {
        let h = Harness::new(&["T0", "T1"], 0).await;

        h.end("T0", TrackEndReason::Finished).await;

        assert_eq!(h.played(), vec!["T1"]);
        assert_eq!(h.player().await.index, 1);
    }

    #[tokio::test]
    async fn end_of_queue_goes_idle() {
        let h = Harness::new(&["T0"], 0).await;

        h.end("T0", TrackEndReason::Stopped).await;

        assert!(h.played().is_empty());
        let player = h.player().await;
        assert_eq!(player.status, PlayerStatus::Idle);
        assert!(player.idle_since.is_some());
        assert_eq!(player.index, 1);
    }

    #[tokio::test]
    async fn replaced_only_clears_track_repeat() {
        let h = Harness::new(&["T0", "T1"], 0).await;
        h.patch(PlayerPatch {
            track_repeat: Some(true),
            ..Default::default()
        })
        .await;

        h.end("T0", TrackEndReason::Replaced).await;

        assert!(h.fake.sent().is_empty());
        let player = h.player().await;
        assert_eq!(player.index, 0);
        assert!(!player.track_repeat);
    }

    #[tokio::test]
    async fn stopped_disarms_track_repeat_and_advances() {
        let h = Harness::new(&["T0", "T1"], 0).await;
        h.patch(PlayerPatch {
            track_repeat: Some(true),
            ..Default::default()
        })
        .await;

        h.end("T0", TrackEndReason::Stopped).await;

        assert_eq!(h.played(), vec!["T1"]);
        let player = h.player().await;
        assert_eq!(player.index, 1);
        assert!(!player.track_repeat);
    }

    #[tokio::test]
    async fn exceptions_and_stuck_tracks_never_move_the_queue() {
        let h = Harness::new(&["T0", "T1"], 0).await;
        let mut events = h.coordinator.subscribe();
        let before = h.player().await;

        h.coordinator
            .handle_event(
                &h.node,
                Event::TrackException(TrackException {
                    guild_id: guild(),
                    track: "T0".into(),
                    info: TrackInfo::default(),
                    error: Some("boom".into()),
                    exception: None,
                }),
            )
            .await
            .unwrap();
        h.coordinator
            .handle_event(
                &h.node,
                Event::TrackStuck(TrackStuck {
                    guild_id: guild(),
                    track: "T0".into(),
                    info: TrackInfo::default(),
                    threshold_ms: 10_000,
                }),
            )
            .await
            .unwrap();

        let after = h.player().await;
        assert_eq!(after.index, before.index);
        assert_eq!(after.status, before.status);
        assert!(h.fake.sent().is_empty());

        assert_eq!(events.recv().await.unwrap().name(), "trackException");
        assert_eq!(events.recv().await.unwrap().name(), "trackStuck");
    }

    #[tokio::test]
    async fn events_for_unknown_guild_destroy_on_node() {
        let h = Harness::new(&[], 0).await;
        h.store.delete_player(PlayerId(GUILD)).await.unwrap();

        h.end("T0", TrackEndReason::Finished).await;

        assert_eq!(h.fake.sent(), vec![Command::Destroy { guild_id: guild() }]);
    }

    #[tokio::test]
    async fn track_start_marks_idle_player_playing() {
        let h = Harness::new(&["T0"], 0).await;
        h.patch(PlayerPatch {
            status: Some(PlayerStatus::Idle),
            idle_since: Some(Some(Utc::now())),
            ..Default::default()
        })
        .await;
        let mut events = h.coordinator.subscribe();

        h.coordinator
            .on_track_start(
                &h.node,
                TrackStart {
                    guild_id: guild(),
                    track: "T0".into(),
                    info: TrackInfo::default(),
                },
            )
            .await
            .unwrap();

        let player = h.player().await;
        assert_eq!(player.status, PlayerStatus::Playing);
        assert!(player.idle_since.is_none());
        let event = events.recv().await.unwrap();
        assert_eq!(event.guild_id(), guild());
        assert_eq!(event.node(), h.node.id());
    }

    #[tokio::test]
    async fn restore_uses_persisted_position_and_pause() {
        let h = Harness::new(&["T0", "T1"], 1).await;
        h.patch(PlayerPatch {
            status: Some(PlayerStatus::Paused),
            position: Some(42_000),
            ..Default::default()
        })
        .await;

        assert!(h.coordinator.restore(guild(), &h.node).await.unwrap());

        assert_eq!(
            h.fake.sent(),
            vec![
                Command::Play {
                    guild_id: guild(),
                    track: "T1".into(),
                    start_time: 42_000,
                    volume: None,
                    pause: true,
                },
                Command::Volume {
                    guild_id: guild(),
                    volume: 70,
                },
            ]
        );
    }

    #[tokio::test]
    async fn restore_skips_idle_players() {
        let h = Harness::new(&["T0"], 0).await;
        h.patch(PlayerPatch {
            status: Some(PlayerStatus::Idle),
            ..Default::default()
        })
        .await;

        assert!(!h.coordinator.restore(guild(), &h.node).await.unwrap());
        assert!(h.fake.sent().is_empty());
    }

    #[tokio::test]
    async fn enqueue_starts_idle_player() {
        let h = Harness::new(&[], 0).await;
        h.patch(PlayerPatch {
            status: Some(PlayerStatus::Idle),
            ..Default::default()
        })
        .await;

        let loaded = |track: &str| LoadedTrack {
            track: track.to_string(),
            info: TrackInfo::default(),
        };
        let created = h
            .coordinator
            .enqueue(&h.node, guild(), vec![loaded("A"), loaded("B")])
            .await
            .unwrap();
        assert_eq!(created.iter().map(|e| e.index).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(h.played(), vec!["A"]);
        assert_eq!(h.player().await.status, PlayerStatus::Playing);

        // Con el reproductor activo solo se encola
        h.coordinator.enqueue(&h.node, guild(), vec![loaded("C")]).await.unwrap();
        assert_eq!(h.played(), vec!["A"]);
        assert_eq!(h.layout().await.last().unwrap(), &(2, "C".to_string()));
    }

    #[tokio::test]
    async fn stop_clears_queue() {
        let h = Harness::new(&["T0", "T1"], 1).await;

        h.coordinator.stop(&h.node, guild()).await.unwrap();

        assert!(h.layout().await.is_empty());
        let player = h.player().await;
        assert_eq!(player.status, PlayerStatus::Idle);
        assert_eq!(player.index, 0);
        assert_eq!(h.fake.ops(), vec!["stop"]);
    }

    #[tokio::test]
    async fn volume_is_clamped_and_persisted() {
        let h = Harness::new(&["T0"], 0).await;

        let applied = h.coordinator.set_volume(&h.node, guild(), 5000).await.unwrap();

        assert_eq!(applied, MAX_VOLUME);
        assert_eq!(h.player().await.volume, MAX_VOLUME);
        assert_eq!(
            h.fake.sent(),
            vec![Command::Volume {
                guild_id: guild(),
                volume: MAX_VOLUME
            }]
        );
    }

    #[tokio::test]
    async fn player_update_persists_position() {
        let h = Harness::new(&["T0"], 0).await;

        h.coordinator
            .on_player_update(PlayerUpdate {
                guild_id: guild(),
                state: PlayerUpdateState {
                    position: Some(12_345),
                    volume: Some(55),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let player = h.player().await;
        assert_eq!(player.position, 12_345);
        assert_eq!(player.volume, 55);
    }

    #[tokio::test]
    async fn commands_without_player_fail() {
        let h = Harness::new(&[], 0).await;
        h.store.delete_player(PlayerId(GUILD)).await.unwrap();

        assert!(matches!(
            h.coordinator.skip(&h.node, guild()).await,
            Err(Error::NoPlayer(_))
        ));
    }
}
