//! Per-guild voice session actor.
//!
//! A [`SessionHandle`] is the only way to reach a session. Requests that need
//! an answer (`connect`, `disconnect`, `reconnect`) carry a oneshot reply;
//! gateway and node events are posted fire-and-forget. The actor handles one
//! message at a time, so two transitions for the same guild never interleave.
//!
//! While a transition waits for a correlated answer (voice state, voice
//! server, node ready, leave confirmation) the actor keeps reading its inbox:
//! messages that answer the wait are absorbed, everything else is deferred
//! and replayed in arrival order once the transition is over.
//!
//! ## Handshake
//!
//! ```text
//! connect(channel) -> op4 join -> VOICE_STATE + VOICE_SERVER -> bind node
//!                  -> voiceUpdate -> WebSocketReadyEvent -> Connected
//! ```
//!
//! Every wait is bounded. A failed or timed-out transition leaves the session
//! `Disconnected`, unbound and without credentials.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::gateway::{self, VoiceGateway, VoiceServerUpdate, VoiceStateUpdate};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::protocol::{Command, Event, VoiceServerPayload, WebSocketClosed};
use crate::node::{AudioNode, NodeId, NodePool};
use crate::playback::PlaybackCoordinator;
use crate::storage::{PlayerId, PlayerPatch};

/// Voice server closes after which only the node side is re-bound.
const NODE_ONLY_CODES: [u16; 3] = [1001, 1006, 4015];
/// Voice server closes that invalidate the credentials.
const CREDENTIAL_CODES: [u16; 2] = [4006, 4009];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Reconnecting,
    Moving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rebind {
    /// Clear credentials and redo the gateway handshake.
    Full,
    /// Re-send the current credentials to a node. Falls back to `Full` when
    /// the credentials are incomplete.
    NodeOnly,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub ready_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub move_settle_timeout: Duration,
    /// Pause between the leave and the new join of an explicit reconnect.
    pub reconnect_delay: Duration,
    pub self_deaf: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(120),
            ready_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(10),
            move_settle_timeout: Duration::from_secs(3),
            reconnect_delay: Duration::from_millis(500),
            self_deaf: true,
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            ready_timeout: config.ready_timeout,
            disconnect_timeout: config.disconnect_timeout,
            move_settle_timeout: config.move_settle_timeout,
            self_deaf: config.self_deaf,
            ..Self::default()
        }
    }
}

/// Read-only view of a session, refreshed after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub node: Option<NodeId>,
    pub channel_id: Option<ChannelId>,
    /// Voice gateway round trip as last reported by the node.
    pub ping: Option<i64>,
    pub complete: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            node: None,
            channel_id: None,
            ping: None,
            complete: false,
        }
    }
}

/// Collaborators every session of the process shares.
#[derive(Clone)]
pub struct SessionDeps {
    pub gateway: Arc<dyn VoiceGateway>,
    pub pool: Arc<NodePool>,
    pub coordinator: Arc<PlaybackCoordinator>,
    pub settings: SessionSettings,
}

enum SessionCommand {
    Connect {
        channel_id: ChannelId,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        confirm: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    VoiceState(VoiceStateUpdate),
    VoiceServer(VoiceServerUpdate),
    NodeEvent {
        node: Arc<dyn AudioNode>,
        event: Event,
    },
    VoicePing(i64),
    /// The node lost its players; rebuild them from persisted state.
    Restore(NodeId),
    /// The node is fatal; move to another one.
    Migrate(NodeId),
}

/// Cloneable address of a guild's session actor. The actor stops once the
/// last handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    guild_id: GuildId,
    inbox: mpsc::UnboundedSender<SessionCommand>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
}

impl SessionHandle {
    pub fn spawn(guild_id: GuildId, deps: SessionDeps) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(SessionSnapshot::default()));

        let session = VoiceSession {
            guild_id,
            deps,
            inbox: rx,
            deferred: VecDeque::new(),
            shared: snapshot.clone(),
            state: SessionState::Idle,
            channel_id: None,
            token: None,
            endpoint: None,
            session_id: None,
            node: None,
            ping: None,
            suppressed: false,
            hand_raised: false,
            stage_asked: None,
            server_seen: false,
            ready: false,
            left: false,
        };
        tokio::spawn(session.run());

        Self {
            guild_id,
            inbox: tx,
            snapshot,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    /// Joins `channel_id` and binds a node. A session that is already
    /// connected to that channel returns immediately.
    pub async fn connect(&self, channel_id: ChannelId) -> Result<()> {
        self.request(|reply| SessionCommand::Connect { channel_id, reply })
            .await
    }

    /// Leaves voice. With `confirm` the call waits for the gateway to report
    /// the leave.
    pub async fn disconnect(&self, confirm: bool) -> Result<()> {
        self.request(|reply| SessionCommand::Disconnect { confirm, reply })
            .await
    }

    /// Leaves and rejoins the current channel with fresh credentials.
    pub async fn reconnect(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Reconnect { reply }).await
    }

    pub fn voice_state(&self, update: VoiceStateUpdate) {
        self.post(SessionCommand::VoiceState(update));
    }

    pub fn voice_server(&self, update: VoiceServerUpdate) {
        self.post(SessionCommand::VoiceServer(update));
    }

    pub fn node_event(&self, node: Arc<dyn AudioNode>, event: Event) {
        self.post(SessionCommand::NodeEvent { node, event });
    }

    pub fn voice_ping(&self, ping: i64) {
        self.post(SessionCommand::VoicePing(ping));
    }

    pub fn restore(&self, node: NodeId) {
        self.post(SessionCommand::Restore(node));
    }

    pub fn migrate(&self, node: NodeId) {
        self.post(SessionCommand::Migrate(node));
    }

    fn post(&self, command: SessionCommand) {
        if self.inbox.send(command).is_err() {
            debug!(guild_id = %self.guild_id, "Sesión de voz cerrada, mensaje descartado");
        }
    }

    async fn request(&self, build: impl FnOnce(oneshot::Sender<Result<()>>) -> SessionCommand) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(build(reply))
            .map_err(|_| Error::SessionClosed(self.guild_id))?;
        response.await.map_err(|_| Error::SessionClosed(self.guild_id))?
    }
}

struct VoiceSession {
    guild_id: GuildId,
    deps: SessionDeps,
    inbox: mpsc::UnboundedReceiver<SessionCommand>,
    deferred: VecDeque<SessionCommand>,
    shared: Arc<RwLock<SessionSnapshot>>,

    state: SessionState,
    channel_id: Option<ChannelId>,
    token: Option<String>,
    endpoint: Option<String>,
    session_id: Option<String>,
    node: Option<Arc<dyn AudioNode>>,
    ping: Option<i64>,

    // Escenario: estado del último voice state y canal ya atendido
    suppressed: bool,
    hand_raised: bool,
    stage_asked: Option<ChannelId>,

    // Correlation flags, reset before each wait.
    server_seen: bool,
    ready: bool,
    left: bool,
}

impl VoiceSession {
    async fn run(mut self) {
        debug!(guild_id = %self.guild_id, "Sesión de voz iniciada");
        while let Some(command) = self.next_command().await {
            self.handle(command).await;
            self.publish();
        }
        debug!(guild_id = %self.guild_id, "Sesión de voz finalizada");
    }

    async fn next_command(&mut self) -> Option<SessionCommand> {
        if let Some(command) = self.deferred.pop_front() {
            return Some(command);
        }
        self.inbox.recv().await
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { channel_id, reply } => {
                let result = self.connect_to(channel_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::Disconnect { confirm, reply } => {
                let result = self.disconnect(confirm).await;
                let _ = reply.send(result);
            }
            SessionCommand::Reconnect { reply } => {
                let result = self.reconnect().await;
                let _ = reply.send(result);
            }
            SessionCommand::VoiceState(update) => self.on_voice_state(update).await,
            SessionCommand::VoiceServer(update) => self.on_voice_server(update).await,
            SessionCommand::NodeEvent { node, event } => self.on_node_event(node, event).await,
            SessionCommand::VoicePing(ping) => self.ping = Some(ping),
            SessionCommand::Restore(node) => self.on_restore(node).await,
            SessionCommand::Migrate(node) => self.on_migrate(node).await,
        }
    }

    async fn connect_to(&mut self, channel_id: ChannelId) -> Result<()> {
        if self.state == SessionState::Connected && self.channel_id == Some(channel_id) && self.node.is_some() {
            return Ok(());
        }
        self.channel_id = Some(channel_id);
        self.connect(Rebind::Full).await
    }

    /// Runs the handshake for the recorded channel. Any failure resets the
    /// session before the error is returned.
    async fn connect(&mut self, kind: Rebind) -> Result<()> {
        let Some(channel_id) = self.channel_id else {
            return Err(Error::MissingVoiceData);
        };
        if !matches!(self.state, SessionState::Moving | SessionState::Reconnecting) {
            self.set_state(SessionState::Connecting);
        }

        if kind == Rebind::Full || !self.complete() {
            if let Err(e) = self.handshake(channel_id).await {
                warn!(guild_id = %self.guild_id, "❌ Handshake de voz fallido: {}", e);
                self.reset().await;
                return Err(e);
            }
        }

        if let Err(e) = self.announce().await {
            warn!(guild_id = %self.guild_id, "❌ El nodo no aceptó la sesión de voz: {}", e);
            self.reset().await;
            return Err(e);
        }

        self.set_state(SessionState::Connected);
        info!(
            guild_id = %self.guild_id,
            channel_id = %channel_id,
            node_id = ?self.node.as_ref().map(|n| n.id()),
            "🔊 Conectado al canal de voz"
        );
        self.ask_to_speak().await;
        Ok(())
    }

    /// In a stage channel the bot joins suppressed. Tries once per channel
    /// to lift that, and raises its hand when it lacks the rights.
    async fn ask_to_speak(&mut self) {
        let Some(channel_id) = self.channel_id else {
            return;
        };
        if !self.suppressed || self.stage_asked == Some(channel_id) {
            return;
        }
        self.stage_asked = Some(channel_id);

        let gateway = &self.deps.gateway;
        match gateway.request_to_speak(self.guild_id, channel_id, true).await {
            Ok(()) => info!(guild_id = %self.guild_id, "🎙️ Supresión levantada en el escenario"),
            Err(e) if self.hand_raised => {
                debug!(guild_id = %self.guild_id, "No se pudo levantar la supresión: {}", e);
            }
            Err(e) => {
                debug!(guild_id = %self.guild_id, "Sin permisos de moderador ({}), pidiendo la palabra", e);
                match gateway.request_to_speak(self.guild_id, channel_id, false).await {
                    Ok(()) => info!(guild_id = %self.guild_id, "✋ Pedido para hablar en el escenario"),
                    Err(e) => warn!(guild_id = %self.guild_id, "No se pudo pedir la palabra: {}", e),
                }
            }
        }
    }

    async fn handshake(&mut self, channel_id: ChannelId) -> Result<()> {
        self.clear_credentials();
        self.deps
            .gateway
            .send_voice_state(self.guild_id, Some(channel_id), false, self.deps.settings.self_deaf)
            .await?;

        let deadline = Instant::now() + self.deps.settings.handshake_timeout;
        self.wait_until(deadline, "voice handshake", |s| s.complete()).await
    }

    /// Binds a node if needed, hands it the credentials and waits for its
    /// ready event.
    async fn announce(&mut self) -> Result<()> {
        let node = self.bind_node().await?;
        let update = self.voice_update()?;

        self.ready = false;
        let deadline = Instant::now() + self.deps.settings.ready_timeout;
        match timeout_at(deadline, node.send(update)).await {
            Ok(sent) => sent?,
            Err(_) => return Err(Error::Timeout("node ready")),
        }
        self.wait_until(deadline, "node ready", |s| s.ready).await
    }

    async fn bind_node(&mut self) -> Result<Arc<dyn AudioNode>> {
        if let Some(node) = &self.node {
            if !node.is_fatal() {
                return Ok(node.clone());
            }
        }

        let node = match self.persisted_node().await {
            Some(node) => node,
            None => {
                let region = self.endpoint.as_deref().and_then(gateway::region);
                self.deps.pool.select(region)?
            }
        };
        info!(guild_id = %self.guild_id, node_id = %node.id(), "🔗 Sesión asignada al nodo");

        self.node = Some(node.clone());
        self.publish();
        self.persist(PlayerPatch {
            node_id: Some(Some(node.id())),
            ..Default::default()
        })
        .await;
        Ok(node)
    }

    /// The node recorded in the player row, if it is still usable.
    async fn persisted_node(&self) -> Option<Arc<dyn AudioNode>> {
        let player = self
            .deps
            .coordinator
            .store()
            .find_player(self.guild_id)
            .await
            .ok()
            .flatten()?;
        let node = self.deps.pool.get(player.node_id?)?;
        (!node.is_fatal()).then_some(node)
    }

    async fn disconnect(&mut self, confirm: bool) -> Result<()> {
        self.set_state(SessionState::Disconnecting);
        self.left = false;

        let result = match self.leave().await {
            Err(e) => Err(e),
            Ok(()) if confirm => {
                let deadline = Instant::now() + self.deps.settings.disconnect_timeout;
                self.wait_until(deadline, "voice disconnect", |s| s.left).await
            }
            Ok(()) => Ok(()),
        };

        if let Some(node) = self.node.take() {
            self.destroy_on(node);
        }
        self.clear_credentials();
        self.channel_id = None;
        self.set_state(SessionState::Disconnected);
        info!(guild_id = %self.guild_id, "👋 Desconectado del canal de voz");
        result
    }

    async fn reconnect(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Idle | SessionState::Disconnected) || self.channel_id.is_none() {
            return Err(Error::MissingVoiceData);
        }
        info!(guild_id = %self.guild_id, "🔄 Reconectando sesión de voz");

        self.set_state(SessionState::Reconnecting);
        self.clear_credentials();
        if let Err(e) = self.leave().await {
            warn!(guild_id = %self.guild_id, "No se pudo abandonar el canal: {}", e);
        }

        let deadline = Instant::now() + self.deps.settings.reconnect_delay;
        let _ = self.wait_until(deadline, "reconnect delay", |_| false).await;
        self.connect(Rebind::Full).await
    }

    async fn on_voice_state(&mut self, update: VoiceStateUpdate) {
        let bound = self.node.is_some() && self.channel_id.is_some();
        let Some(channel_id) = update.channel_id else {
            // Tras un 4014 la sesión sigue vinculada: la expulsión cuenta
            let ignored = match self.state {
                SessionState::Idle | SessionState::Disconnecting | SessionState::Reconnecting => true,
                SessionState::Disconnected => !bound,
                _ => false,
            };
            if !ignored {
                self.on_removed().await;
            }
            return;
        };

        if !bound || self.state == SessionState::Idle {
            debug!(guild_id = %self.guild_id, "Voice state ignorado sin sesión activa");
            return;
        }

        self.note_stage(&update);
        // Un movimiento puede llegar después del cierre de voz (4014)
        if self.channel_id != Some(channel_id) {
            self.on_move(channel_id, update.session_id).await;
            return;
        }
        if self.state == SessionState::Disconnected {
            debug!(guild_id = %self.guild_id, "Voice state ignorado con la voz cerrada");
            return;
        }

        let changed = self.session_id.as_deref() != Some(update.session_id.as_str());
        let was_complete = self.complete();
        self.session_id = Some(update.session_id);
        if changed && was_complete {
            info!(guild_id = %self.guild_id, "🔁 Session id de voz cambiado");
            if let Err(e) = self.connect(Rebind::NodeOnly).await {
                warn!(guild_id = %self.guild_id, "No se pudo re-vincular el nodo: {}", e);
            }
            return;
        }
        if self.state == SessionState::Connected {
            self.ask_to_speak().await;
        }
    }

    /// The bot was taken out of voice by someone else.
    async fn on_removed(&mut self) {
        info!(guild_id = %self.guild_id, "🚪 Bot removido del canal de voz");
        if let Err(e) = self.deps.coordinator.destroy(self.guild_id, None).await {
            warn!(guild_id = %self.guild_id, "Error eliminando el reproductor: {}", e);
        }
        if let Some(node) = self.node.take() {
            self.destroy_on(node);
        }
        self.clear_credentials();
        self.channel_id = None;
        self.set_state(SessionState::Disconnected);
    }

    async fn on_move(&mut self, channel_id: ChannelId, session_id: String) {
        info!(guild_id = %self.guild_id, channel_id = %channel_id, "🔀 Movido a otro canal de voz");
        // Con la voz ya cerrada el nodo necesita un voiceUpdate aunque el
        // servidor no cambie.
        let closed = self.state == SessionState::Disconnected;
        self.set_state(SessionState::Moving);
        self.channel_id = Some(channel_id);
        self.session_id = Some(session_id);
        self.persist(PlayerPatch {
            voice_channel_id: Some(channel_id),
            ..Default::default()
        })
        .await;

        let previous = (self.token.clone(), self.endpoint.clone());
        self.server_seen = false;
        let deadline = Instant::now() + self.deps.settings.move_settle_timeout;
        // Sin un voice server nuevo las credenciales siguen valiendo.
        let _ = self.wait_until(deadline, "voice server", |s| s.server_seen).await;

        if closed || (self.token.clone(), self.endpoint.clone()) != previous {
            if let Err(e) = self.connect(Rebind::NodeOnly).await {
                warn!(guild_id = %self.guild_id, "Error re-vinculando tras el movimiento: {}", e);
            }
            return;
        }
        self.set_state(SessionState::Connected);
        self.ask_to_speak().await;
    }

    async fn on_voice_server(&mut self, update: VoiceServerUpdate) {
        if matches!(
            self.state,
            SessionState::Idle | SessionState::Disconnected | SessionState::Disconnecting
        ) {
            debug!(guild_id = %self.guild_id, "Voice server ignorado sin sesión activa");
            return;
        }
        if !self.apply_server(update) || self.session_id.is_none() {
            return;
        }

        info!(guild_id = %self.guild_id, "🌐 Servidor de voz cambiado");
        if let Err(e) = self.connect(Rebind::NodeOnly).await {
            warn!(guild_id = %self.guild_id, "Error re-vinculando el servidor de voz: {}", e);
            return;
        }
        self.restore_playback().await;
    }

    async fn on_node_event(&mut self, node: Arc<dyn AudioNode>, event: Event) {
        match event {
            // Solo cuenta mientras se espera dentro de un handshake
            Event::WebSocketReady(_) => {
                debug!(
                    guild_id = %self.guild_id,
                    node_id = %node.id(),
                    state = ?self.state,
                    "Ready fuera de handshake ignorado"
                );
            }
            Event::WebSocketClosed(closed) => self.on_socket_closed(node.id(), closed).await,
            event => {
                if let Event::PlayerUpdate(update) = &event {
                    if let Some(ping) = update.state.ping {
                        self.ping = Some(ping);
                    }
                }
                if let Err(e) = self.deps.coordinator.handle_event(&node, event).await {
                    warn!(guild_id = %self.guild_id, node_id = %node.id(), "Error procesando evento: {}", e);
                }
            }
        }
    }

    async fn on_socket_closed(&mut self, node_id: NodeId, closed: WebSocketClosed) {
        if !self.is_bound_to(node_id) {
            debug!(guild_id = %self.guild_id, code = closed.code, "Cierre de voz de un nodo ajeno");
            return;
        }
        info!(
            guild_id = %self.guild_id,
            node_id = %node_id,
            code = closed.code,
            by_remote = closed.by_remote,
            "🔇 Conexión de voz cerrada: {}",
            closed.reason.as_deref().unwrap_or("sin motivo")
        );

        if self.state != SessionState::Reconnecting {
            self.set_state(SessionState::Disconnected);
        }

        let kind = if NODE_ONLY_CODES.contains(&closed.code) {
            Rebind::NodeOnly
        } else if CREDENTIAL_CODES.contains(&closed.code) {
            self.clear_credentials();
            Rebind::Full
        } else {
            return;
        };

        if let Err(e) = self.connect(kind).await {
            warn!(guild_id = %self.guild_id, code = closed.code, "No se pudo recuperar la voz: {}", e);
        }
    }

    async fn on_restore(&mut self, lost: NodeId) {
        let Some(node) = self.node.clone().filter(|n| n.id() == lost) else {
            return;
        };
        info!(guild_id = %self.guild_id, node_id = %lost, "♻️ Recuperando sesión tras perder el nodo");

        let rebound = match self.voice_update() {
            Ok(update) => {
                let deadline = Instant::now() + self.deps.settings.ready_timeout;
                timeout_at(deadline, node.send(update))
                    .await
                    .unwrap_or(Err(Error::Timeout("voice update")))
            }
            Err(_) => self.connect(Rebind::Full).await,
        };
        if let Err(e) = rebound {
            warn!(guild_id = %self.guild_id, "Error re-enviando voiceUpdate: {}", e);
            return;
        }
        self.restore_playback().await;
    }

    async fn on_migrate(&mut self, failed: NodeId) {
        if !self.is_bound_to(failed) {
            return;
        }
        warn!(guild_id = %self.guild_id, node_id = %failed, "🚚 Migrando sesión a otro nodo");

        self.node = None;
        if let Err(e) = self.connect(Rebind::NodeOnly).await {
            warn!(guild_id = %self.guild_id, "Migración fallida: {}", e);
            return;
        }
        self.restore_playback().await;
    }

    async fn restore_playback(&mut self) {
        let Some(node) = self.node.clone() else {
            return;
        };
        let deadline = Instant::now() + self.deps.settings.ready_timeout;
        let restored = timeout_at(deadline, self.deps.coordinator.restore(self.guild_id, &node))
            .await
            .unwrap_or(Err(Error::Timeout("playback restore")));
        if let Err(e) = restored {
            warn!(guild_id = %self.guild_id, node_id = %node.id(), "Error restaurando reproducción: {}", e);
        }
    }

    /// Reads the inbox until `done` holds or the deadline passes.
    async fn wait_until(&mut self, deadline: Instant, what: &'static str, done: fn(&Self) -> bool) -> Result<()> {
        loop {
            if done(self) {
                return Ok(());
            }
            match timeout_at(deadline, self.inbox.recv()).await {
                Err(_) => return Err(Error::Timeout(what)),
                Ok(None) => return Err(Error::SessionClosed(self.guild_id)),
                Ok(Some(command)) => self.absorb(command),
            }
        }
    }

    fn absorb(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::VoiceState(update) => match update.channel_id {
                None if self.state == SessionState::Disconnecting => self.left = true,
                None if self.state == SessionState::Reconnecting => {}
                Some(channel_id) if Some(channel_id) == self.channel_id => {
                    self.note_stage(&update);
                    self.session_id = Some(update.session_id);
                }
                _ => self.deferred.push_back(SessionCommand::VoiceState(update)),
            },
            SessionCommand::VoiceServer(update) => {
                self.apply_server(update);
            }
            SessionCommand::NodeEvent {
                node,
                event: Event::WebSocketReady(_),
            } if self.is_bound_to(node.id()) => self.ready = true,
            SessionCommand::VoicePing(ping) => self.ping = Some(ping),
            other => self.deferred.push_back(other),
        }
    }

    /// Records a voice server assignment. Returns whether it changed the
    /// credentials.
    fn apply_server(&mut self, update: VoiceServerUpdate) -> bool {
        let changed = self.token.as_deref() != Some(update.token.as_str())
            || update
                .endpoint
                .as_ref()
                .is_some_and(|endpoint| self.endpoint.as_ref() != Some(endpoint));

        self.token = Some(update.token);
        if let Some(endpoint) = update.endpoint {
            self.endpoint = Some(endpoint);
        }
        self.server_seen = true;
        changed
    }

    fn note_stage(&mut self, update: &VoiceStateUpdate) {
        self.suppressed = update.suppress;
        self.hand_raised = update.request_to_speak_timestamp.is_some();
    }

    fn voice_update(&self) -> Result<Command> {
        match (&self.token, &self.endpoint, &self.session_id) {
            (Some(token), Some(endpoint), Some(session_id)) => Ok(Command::VoiceUpdate {
                guild_id: self.guild_id,
                session_id: session_id.clone(),
                event: VoiceServerPayload {
                    token: token.clone(),
                    endpoint: endpoint.clone(),
                },
            }),
            _ => Err(Error::MissingVoiceData),
        }
    }

    async fn leave(&self) -> Result<()> {
        self.deps
            .gateway
            .send_voice_state(self.guild_id, None, false, self.deps.settings.self_deaf)
            .await
    }

    /// Tears a failed transition down to a clean `Disconnected`.
    async fn reset(&mut self) {
        if let Some(node) = self.node.take() {
            self.destroy_on(node);
        }
        if let Err(e) = self.leave().await {
            debug!(guild_id = %self.guild_id, "Leave tras fallo no enviado: {}", e);
        }
        self.clear_credentials();
        self.set_state(SessionState::Disconnected);
    }

    /// Sent from a detached task: a node that is down would otherwise stall
    /// the actor until it reconnects.
    fn destroy_on(&self, node: Arc<dyn AudioNode>) {
        let guild_id = self.guild_id;
        tokio::spawn(async move {
            if let Err(e) = node.send(Command::Destroy { guild_id }).await {
                debug!(guild_id = %guild_id, node_id = %node.id(), "destroy no enviado: {}", e);
            }
        });
    }

    async fn persist(&self, patch: PlayerPatch) {
        let store = self.deps.coordinator.store();
        if let Err(e) = store.update_player(PlayerId::from(self.guild_id), patch).await {
            debug!(guild_id = %self.guild_id, "Sesión no persistida: {:#}", e);
        }
    }

    fn clear_credentials(&mut self) {
        self.token = None;
        self.endpoint = None;
        self.session_id = None;
        self.server_seen = false;
    }

    fn complete(&self) -> bool {
        self.token.is_some() && self.endpoint.is_some() && self.session_id.is_some()
    }

    fn is_bound_to(&self, node: NodeId) -> bool {
        self.node.as_ref().is_some_and(|n| n.id() == node)
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(guild_id = %self.guild_id, "Sesión {:?} -> {:?}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        *self.shared.write() = SessionSnapshot {
            state: self.state,
            node: self.node.as_ref().map(|n| n.id()),
            channel_id: self.channel_id,
            ping: self.ping,
            complete: self.complete(),
        };
    }
}
