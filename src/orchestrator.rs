//! # Orchestrator
//!
//! The one object that owns the node pool, the per-guild session registry
//! and the playback coordinator. Gateway voice events and node signals are
//! routed from here to the session actor of the guild they belong to.
//!
//! ```text
//! serenity ──voice state/server──┐
//!                                ├─> Orchestrator ──> SessionHandle (per guild) ──> PlaybackCoordinator
//! NodeClient ──NodeSignal────────┘                                                       │
//!                                                                                       └─> AudioNode
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::node::protocol::{Event, LoadType, Requester, TrackLoad};
use crate::node::{AudioNode, NodeId, NodePool, NodeSignal};
use crate::playback::PlaybackCoordinator;
use crate::storage::{NewPlayer, PlayerStore, QueueEntry};
use crate::voice::{
    SessionDeps, SessionHandle, SessionSettings, SessionState, VoiceGateway, VoiceServerUpdate, VoiceStateUpdate,
};

/// A node event for a guild without a voice session.
type Orphan = (Arc<dyn AudioNode>, Event);

/// Outcome of [`Orchestrator::replay_persisted_players`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub replayed: usize,
    pub failed: usize,
}

pub struct Orchestrator {
    pool: Arc<NodePool>,
    sessions: DashMap<GuildId, SessionHandle>,
    coordinator: Arc<PlaybackCoordinator>,
    gateway: Arc<dyn VoiceGateway>,
    settings: SessionSettings,
    default_volume: u16,
    orphans: mpsc::UnboundedSender<Orphan>,
    // Se toma al llegar el primer evento huérfano
    orphan_inbox: Mutex<Option<mpsc::UnboundedReceiver<Orphan>>>,
}

impl Orchestrator {
    pub fn new(
        pool: NodePool,
        store: Arc<dyn PlayerStore>,
        gateway: Arc<dyn VoiceGateway>,
        settings: SessionSettings,
        default_volume: u16,
    ) -> Self {
        let (orphans, orphan_inbox) = mpsc::unbounded_channel();
        Self {
            pool: Arc::new(pool),
            sessions: DashMap::new(),
            coordinator: Arc::new(PlaybackCoordinator::new(store)),
            gateway,
            settings,
            default_volume,
            orphans,
            orphan_inbox: Mutex::new(Some(orphan_inbox)),
        }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    pub fn coordinator(&self) -> &Arc<PlaybackCoordinator> {
        &self.coordinator
    }

    /// The guild's session, spawning it on first use.
    pub fn session(&self, guild_id: GuildId) -> SessionHandle {
        self.sessions
            .entry(guild_id)
            .or_insert_with(|| {
                SessionHandle::spawn(
                    guild_id,
                    SessionDeps {
                        gateway: self.gateway.clone(),
                        pool: self.pool.clone(),
                        coordinator: self.coordinator.clone(),
                        settings: self.settings.clone(),
                    },
                )
            })
            .clone()
    }

    pub fn existing_session(&self, guild_id: GuildId) -> Option<SessionHandle> {
        self.sessions.get(&guild_id).map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Our own voice state. Guilds without a session are ignored.
    ///
    /// Being taken out of voice while connected ends the session: the actor
    /// still deletes the player, then stops once its handle is dropped here.
    pub fn on_voice_state(&self, update: VoiceStateUpdate) {
        let guild_id = update.guild_id;
        let Some(session) = self.existing_session(guild_id) else {
            debug!(guild_id = %guild_id, "Voice state sin sesión");
            return;
        };

        let snapshot = session.snapshot();
        let removed = update.channel_id.is_none()
            && match snapshot.state {
                SessionState::Connected | SessionState::Moving => true,
                // Voz cerrada por el servidor pero aún vinculada
                SessionState::Disconnected => snapshot.node.is_some() && snapshot.channel_id.is_some(),
                _ => false,
            };
        session.voice_state(update);
        if removed {
            self.sessions.remove(&guild_id);
            debug!(guild_id = %guild_id, "Sesión retirada del registro");
        }
    }

    pub fn on_voice_server(&self, update: VoiceServerUpdate) {
        match self.existing_session(update.guild_id) {
            Some(session) => session.voice_server(update),
            None => debug!(guild_id = %update.guild_id, "Voice server sin sesión"),
        }
    }

    /// Drains node signals until every sender is gone.
    pub fn spawn_signal_loop(self: &Arc<Self>, mut signals: mpsc::UnboundedReceiver<NodeSignal>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                orchestrator.handle_signal(signal);
            }
            debug!("Canal de señales de nodos cerrado");
        })
    }

    pub fn handle_signal(&self, signal: NodeSignal) {
        match signal {
            NodeSignal::Event { node, event } => {
                let Some(node) = self.pool.get(node) else {
                    warn!(node_id = %node, "Evento de un nodo no registrado");
                    return;
                };
                let guild_id = event.guild_id();
                match event {
                    // Solo interesan a una sesión ya existente.
                    Event::WebSocketClosed(_) | Event::WebSocketReady(_) => {
                        if let Some(session) = self.existing_session(guild_id) {
                            session.node_event(node, event);
                        }
                    }
                    // Los eventos de pista pasan por el actor del guild; sin
                    // sesión van en orden al coordinador.
                    event => match self.existing_session(guild_id) {
                        Some(session) => session.node_event(node, event),
                        None => self.orphan(node, event),
                    },
                }
            }
            NodeSignal::VoicePing { guild_id, ping, .. } => {
                if let Some(session) = self.existing_session(guild_id) {
                    session.voice_ping(ping);
                }
            }
            NodeSignal::SessionLost(node) => {
                let bound = self.sessions_on(node);
                warn!(node_id = %node, "♻️ Nodo sin sesión reanudada, restaurando {} guilds", bound.len());
                for session in bound {
                    session.restore(node);
                }
            }
            NodeSignal::Fatal(node) => {
                let bound = self.sessions_on(node);
                error!(node_id = %node, "💀 Nodo inutilizable, migrando {} guilds", bound.len());
                for session in bound {
                    session.migrate(node);
                }
            }
        }
    }

    /// Hands an event of a guild without a session to the coordinator. A
    /// single worker keeps them in arrival order.
    fn orphan(&self, node: Arc<dyn AudioNode>, event: Event) {
        if let Some(mut inbox) = self.orphan_inbox.lock().take() {
            let coordinator = self.coordinator.clone();
            let deadline = self.settings.ready_timeout;
            tokio::spawn(async move {
                while let Some((node, event)) = inbox.recv().await {
                    let guild_id = event.guild_id();
                    let handled = tokio::time::timeout(deadline, coordinator.handle_event(&node, event))
                        .await
                        .unwrap_or(Err(Error::Timeout("orphan event")));
                    if let Err(e) = handled {
                        warn!(guild_id = %guild_id, node_id = %node.id(), "Error procesando evento sin sesión: {}", e);
                    }
                }
            });
        }
        if self.orphans.send((node, event)).is_err() {
            debug!("Worker de eventos sin sesión detenido");
        }
    }

    fn sessions_on(&self, node: NodeId) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().snapshot().node == Some(node))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Connects the guild's session to `channel_id`. A session that was not
    /// already connected gets its playback rebuilt from persisted state.
    pub async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<Arc<dyn AudioNode>> {
        let session = self.session(guild_id);
        let was_connected = session.snapshot().state == SessionState::Connected;

        session.connect(channel_id).await?;
        let node = self.node_for(guild_id)?;

        if !was_connected {
            self.coordinator.restore(guild_id, &node).await?;
        }
        Ok(node)
    }

    /// Loads `identifier` on the guild's node and queues the result. Searches
    /// queue only their best match.
    pub async fn play(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        text_channel_id: Option<ChannelId>,
        identifier: &str,
        requester: UserId,
    ) -> Result<Vec<QueueEntry>> {
        let store = self.coordinator.store();
        if store.find_player(guild_id).await?.is_none() {
            store
                .create_player(NewPlayer {
                    guild_id,
                    voice_channel_id: channel_id,
                    text_channel_id,
                    volume: self.default_volume,
                })
                .await?;
            info!(guild_id = %guild_id, "🎵 Reproductor creado");
        }

        let node = self.join(guild_id, channel_id).await?;
        let load = node
            .load_tracks(
                identifier,
                Requester {
                    id: requester.to_string(),
                },
            )
            .await?;

        let tracks = queueable(load);
        if tracks.is_empty() {
            info!(guild_id = %guild_id, "🔍 Sin resultados para '{}'", identifier);
            return Ok(Vec::new());
        }
        self.coordinator.enqueue(&node, guild_id, tracks).await
    }

    /// Leaves voice and forgets the guild's player and queue.
    pub async fn leave(&self, guild_id: GuildId) -> Result<()> {
        // La sesión sigue registrada hasta que el gateway confirma la salida.
        let left = match self.existing_session(guild_id) {
            Some(session) => session.disconnect(true).await,
            None => Ok(()),
        };
        self.sessions.remove(&guild_id);
        self.coordinator.destroy(guild_id, None).await?;
        left
    }

    pub async fn skip(&self, guild_id: GuildId) -> Result<()> {
        let node = self.node_for(guild_id)?;
        self.coordinator.skip(&node, guild_id).await
    }

    pub async fn pause(&self, guild_id: GuildId, pause: bool) -> Result<()> {
        let node = self.node_for(guild_id)?;
        self.coordinator.pause(&node, guild_id, pause).await
    }

    pub async fn seek(&self, guild_id: GuildId, position: u64) -> Result<()> {
        let node = self.node_for(guild_id)?;
        self.coordinator.seek(&node, guild_id, position).await
    }

    pub async fn set_volume(&self, guild_id: GuildId, volume: u16) -> Result<u16> {
        let node = self.node_for(guild_id)?;
        self.coordinator.set_volume(&node, guild_id, volume).await
    }

    pub async fn stop(&self, guild_id: GuildId) -> Result<()> {
        let node = self.node_for(guild_id)?;
        self.coordinator.stop(&node, guild_id).await
    }

    /// The node the guild's session is bound to.
    pub fn node_for(&self, guild_id: GuildId) -> Result<Arc<dyn AudioNode>> {
        self.existing_session(guild_id)
            .and_then(|session| session.snapshot().node)
            .and_then(|id| self.pool.get(id))
            .ok_or(Error::MissingVoiceData)
    }

    /// Reconnects every persisted player to its voice channel and resumes
    /// playback where the store says it was. Players that cannot reconnect
    /// are deleted.
    pub async fn replay_persisted_players(&self) -> Result<ReplaySummary> {
        let players = self.coordinator.store().list_players().await?;
        if players.is_empty() {
            return Ok(ReplaySummary::default());
        }
        info!("🔁 Reanudando {} reproductores persistidos", players.len());

        let attempts = players.iter().map(|player| async move {
            let guild_id = player.guild_id;
            match self.join(guild_id, player.voice_channel_id).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(guild_id = %guild_id, "❌ No se pudo reanudar: {}", e);
                    self.sessions.remove(&guild_id);
                    if let Err(e) = self.coordinator.destroy(guild_id, None).await {
                        warn!(guild_id = %guild_id, "Error eliminando reproductor: {}", e);
                    }
                    false
                }
            }
        });

        let outcomes = join_all(attempts).await;
        let replayed = outcomes.iter().filter(|ok| **ok).count();
        let summary = ReplaySummary {
            replayed,
            failed: outcomes.len() - replayed,
        };
        info!(
            "✅ Reproductores reanudados: {} (fallidos: {})",
            summary.replayed, summary.failed
        );
        Ok(summary)
    }
}

/// Tracks worth queueing from a load result.
fn queueable(load: TrackLoad) -> Vec<crate::node::protocol::LoadedTrack> {
    match load.load_type {
        LoadType::SearchResult => load.tracks.into_iter().take(1).collect(),
        LoadType::TrackLoaded | LoadType::PlaylistLoaded => load.tracks,
        LoadType::NoMatches | LoadType::LoadFailed => Vec::new(),
    }
}
