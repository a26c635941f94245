//! # Node Client
//!
//! One long-lived WebSocket per audio node.
//!
//! ## Outgoing commands
//!
//! [`NodeClient::send`] never drops a command. While the socket is open the
//! command goes straight to the writer task; otherwise it is appended to a
//! FIFO that is flushed, in order, right after the next successful
//! (re)connect. Many guild sessions send through the same client at once, so
//! the writer handle and the FIFO live behind one lock and are swapped
//! atomically when the socket comes up or goes down.
//!
//! ## Track loads
//!
//! Socket loads are correlated by nonce. A waiter is registered before the
//! `loadTracks` frame is queued and is removed by a guard on every exit path
//! (response, timeout, cancellation, transport failure). Every socket close
//! fails all in-flight waiters.
//!
//! ## Resume
//!
//! On the first connection of the process the client registers a resume key
//! with `configureResuming`. Later reconnects present that key; if the node
//! does not answer with `Session-Resumed: true` the client emits
//! [`NodeSignal::SessionLost`] so the orchestrator can rebuild every player
//! it hosted from persisted state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{
    self, Command, Frame, Inbound, LoadTracksResponse, LoadedTrack, Requester, Stats, TrackInfo, TrackLoad,
};
use super::rest::NodeRest;
use super::{stats, AudioNode, NodeId, NodeOptions, NodeSettings, NodeSignal};
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code for an abnormal closure (no close frame).
const ABNORMAL_CLOSURE: u16 = 1006;
/// A connection that stays up this long counts as healthy even if the node
/// never spoke.
const STABLE_UPTIME: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Connecting,
    Connected,
    Resuming,
    Disconnected,
}

/// Versions advertised by the node in its upgrade response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeVersions {
    pub api: Option<String>,
    pub lavalink: Option<String>,
    pub lavaplayer: Option<String>,
    pub jvm: Option<String>,
    pub build: Option<String>,
}

impl NodeVersions {
    fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        Self {
            api: get("lavalink-api-version"),
            lavalink: get("lavalink-major-version"),
            lavaplayer: get("lavalink-lavaplayer-version"),
            jvm: get("lavalink-jvm-version"),
            build: get("lavalink-build-time"),
        }
    }
}

struct Outgoing {
    op: &'static str,
    payload: String,
    ack: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct Link {
    writer: Option<mpsc::UnboundedSender<Outgoing>>,
    pending: VecDeque<Outgoing>,
}

/// Why a served connection ended.
enum Closure {
    Shutdown,
    Remote { code: u16, reason: String },
    Failed(WsError),
}

type LoadWaiters = DashMap<String, oneshot::Sender<Result<LoadTracksResponse>>>;

/// Removes a load waiter when the awaiting future finishes or is dropped.
struct LoadGuard<'a> {
    loads: &'a LoadWaiters,
    nonce: &'a str,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.loads.remove(self.nonce);
    }
}

pub struct NodeClient {
    id: NodeId,
    options: NodeOptions,
    settings: NodeSettings,
    resume_key: String,
    state: RwLock<NodeState>,
    started: AtomicBool,
    fatal: AtomicBool,
    resume_configured: AtomicBool,
    connected_once: AtomicBool,
    stats: RwLock<Option<Stats>>,
    versions: RwLock<Option<NodeVersions>>,
    ping: RwLock<Option<Duration>>,
    ping_sent_at: Mutex<Option<Instant>>,
    link: Mutex<Link>,
    loads: LoadWaiters,
    nonce_seq: AtomicU64,
    signals: mpsc::UnboundedSender<NodeSignal>,
    shutdown: CancellationToken,
    rest: NodeRest,
}

impl NodeClient {
    pub fn new(
        id: NodeId,
        options: NodeOptions,
        settings: NodeSettings,
        signals: mpsc::UnboundedSender<NodeSignal>,
    ) -> Self {
        let rest = NodeRest::new(options.clone(), settings.load_timeout);

        Self {
            id,
            resume_key: generate_resume_key(),
            options,
            settings,
            state: RwLock::new(NodeState::Idle),
            started: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            resume_configured: AtomicBool::new(false),
            connected_once: AtomicBool::new(false),
            stats: RwLock::new(None),
            versions: RwLock::new(None),
            ping: RwLock::new(None),
            ping_sent_at: Mutex::new(None),
            link: Mutex::new(Link::default()),
            loads: DashMap::new(),
            nonce_seq: AtomicU64::new(0),
            signals,
            shutdown: CancellationToken::new(),
            rest,
        }
    }

    /// Starts the connection task. Returns `None` if it is already running.
    pub fn connect(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let node = Arc::clone(self);
        Some(tokio::spawn(async move { node.run().await }))
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn options(&self) -> &NodeOptions {
        &self.options
    }

    pub fn stats(&self) -> Option<Stats> {
        *self.stats.read()
    }

    pub fn versions(&self) -> Option<NodeVersions> {
        self.versions.read().clone()
    }

    /// Round trip of the last answered liveness ping.
    pub fn ping(&self) -> Option<Duration> {
        *self.ping.read()
    }

    pub fn resume_key(&self) -> &str {
        &self.resume_key
    }

    pub fn pending_len(&self) -> usize {
        self.link.lock().pending.len()
    }

    pub fn in_flight_loads(&self) -> usize {
        self.loads.len()
    }

    /// Sends a command and waits until it is written to the socket. While the
    /// node is offline this waits for the next connection.
    pub async fn send(&self, command: Command) -> Result<()> {
        let ack = self.queue_command(&command)?;
        ack.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Loads an identifier. URLs go over the socket, searches over REST.
    pub async fn load_tracks(&self, identifier: &str, requester: Requester) -> Result<TrackLoad> {
        if url::Url::parse(identifier).is_ok() {
            self.load_track(identifier, requester).await
        } else {
            self.rest.load_tracks(identifier, &requester).await.into_result()
        }
    }

    /// Socket load correlated by nonce.
    pub async fn load_track(&self, identifier: &str, requester: Requester) -> Result<TrackLoad> {
        let nonce = self.next_nonce();
        let (waiter, response) = oneshot::channel();
        self.loads.insert(nonce.clone(), waiter);
        let _guard = LoadGuard {
            loads: &self.loads,
            nonce: &nonce,
        };

        let ack = self.queue_command(&Command::LoadTracks {
            identifier: identifier.to_string(),
            user: requester,
            nonce: nonce.clone(),
        })?;

        // Un fallo de escritura resuelve la carga sin esperar al timeout
        let write_failed = async move {
            match ack.await {
                Ok(Ok(())) => std::future::pending::<Error>().await,
                Ok(Err(e)) => e,
                Err(_) => Error::ConnectionClosed,
            }
        };
        let answered = async move {
            tokio::select! {
                result = response => result.unwrap_or(Err(Error::ConnectionClosed)),
                error = write_failed => Err(error),
            }
        };

        debug!(node_id = %self.id, nonce = %nonce, "📤 loadTracks '{}'", identifier);
        let response = tokio::time::timeout(self.settings.load_timeout, answered)
            .await
            .map_err(|_| Error::Timeout("track load"))??;
        response.into_result()
    }

    pub async fn decode_track(&self, track: &str) -> Result<TrackInfo> {
        self.rest.decode_track(track).await
    }

    pub async fn decode_tracks(&self, tracks: &[String]) -> Result<Vec<LoadedTrack>> {
        self.rest.decode_tracks(tracks).await
    }

    fn next_nonce(&self) -> String {
        let seq = self.nonce_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", chrono::Utc::now().timestamp_millis(), seq)
    }

    fn signal(&self, signal: NodeSignal) {
        if self.signals.send(signal).is_err() {
            debug!(node_id = %self.id, "Nadie escucha las señales del nodo");
        }
    }

    fn set_state(&self, state: NodeState) {
        *self.state.write() = state;
    }

    /// Hands a command to the writer or queues it. The returned receiver
    /// resolves once the frame is on the wire.
    fn queue_command(&self, command: &Command) -> Result<oneshot::Receiver<Result<()>>> {
        let payload = serde_json::to_string(command)?;
        let (ack, receiver) = oneshot::channel();
        let outgoing = Outgoing {
            op: command.op(),
            payload,
            ack,
        };

        let mut link = self.link.lock();
        if self.fatal.load(Ordering::SeqCst) {
            return Err(Error::NodeFatal(self.id));
        }

        let outgoing = match &link.writer {
            Some(writer) => match writer.send(outgoing) {
                Ok(()) => return Ok(receiver),
                Err(mpsc::error::SendError(outgoing)) => outgoing,
            },
            None => outgoing,
        };

        debug!(node_id = %self.id, op = outgoing.op, "📥 Nodo sin conexión, comando en cola");
        link.pending.push_back(outgoing);
        Ok(receiver)
    }

    async fn run(self: Arc<Self>) {
        let mut attempts: u32 = 0;

        loop {
            let resuming = self.state() == NodeState::Resuming;
            if !resuming {
                self.set_state(NodeState::Connecting);
            }

            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                opened = self.open(resuming) => opened,
            };

            let delay = match opened {
                Ok((stream, resumed)) => {
                    let (closure, healthy) = self.serve(stream, resumed).await;
                    if matches!(closure, Closure::Shutdown) {
                        break;
                    }
                    let delay = self.on_closed(closure);
                    if healthy {
                        attempts = 0;
                        delay
                    } else {
                        // Aceptó el upgrade pero cerró sin llegar a funcionar
                        attempts += 1;
                        if attempts >= self.settings.max_reconnect_attempts {
                            self.mark_fatal(&format!("{attempts} conexiones cerradas al abrirse"));
                            return;
                        }
                        let retry = backoff(
                            self.settings.reconnect_base_delay,
                            self.settings.reconnect_max_delay,
                            attempts,
                        );
                        warn!(
                            node_id = %self.id,
                            attempt = attempts,
                            "🔌 {} cerró la conexión al abrirla (reintento en {:?})",
                            self.options.url,
                            retry
                        );
                        delay.max(retry)
                    }
                }
                Err(e) if is_auth_rejection(&e) => {
                    self.mark_fatal(&format!("handshake rechazado: {e}"));
                    return;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.settings.max_reconnect_attempts {
                        self.mark_fatal(&format!("{attempts} intentos de conexión fallidos: {e}"));
                        return;
                    }
                    if !resuming {
                        self.set_state(NodeState::Disconnected);
                    }
                    let delay = backoff(
                        self.settings.reconnect_base_delay,
                        self.settings.reconnect_max_delay,
                        attempts,
                    );
                    warn!(
                        node_id = %self.id,
                        attempt = attempts,
                        "🔌 No se pudo conectar a {}: {} (reintento en {:?})",
                        self.options.url,
                        e,
                        delay
                    );
                    delay
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.teardown();
    }

    fn handshake_request(&self, resuming: bool) -> Result<Request> {
        let mut request = self.options.ws_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("authorization", header_value(&self.options.password)?);
        headers.insert("user-id", header_value(&self.settings.user_id.to_string())?);
        headers.insert("client-name", header_value(&self.settings.client_name)?);
        if resuming {
            headers.insert("resume-key", header_value(&self.resume_key)?);
        }
        Ok(request)
    }

    /// Opens the socket. The flag reports whether the node confirmed a resume.
    async fn open(&self, resuming: bool) -> Result<(WsStream, bool)> {
        let request = self.handshake_request(resuming)?;
        debug!(node_id = %self.id, resuming, "Conectando a {}", self.options.url);

        let (stream, response) = connect_async(request).await?;
        let headers = response.headers();
        *self.versions.write() = Some(NodeVersions::from_headers(headers));

        let resumed = resuming
            && headers
                .get("session-resumed")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.eq_ignore_ascii_case("true"));
        Ok((stream, resumed))
    }

    /// Serves a connection until it ends. The flag reports whether it proved
    /// healthy: an inbound frame arrived or it stayed up for [`STABLE_UPTIME`].
    async fn serve(&self, stream: WsStream, resumed: bool) -> (Closure, bool) {
        let (mut sink, mut source) = stream.split();
        let opened_at = Instant::now();
        let mut heard = false;

        // configureResuming va antes que cualquier comando en cola
        if !self.resume_configured.load(Ordering::SeqCst) {
            let configure = Command::ConfigureResuming {
                key: self.resume_key.clone(),
                timeout: self.settings.resume_timeout,
            };
            match serde_json::to_string(&configure) {
                Ok(payload) => {
                    if let Err(e) = sink.send(Message::Text(payload)).await {
                        return (Closure::Failed(e), false);
                    }
                    self.resume_configured.store(true, Ordering::SeqCst);
                    debug!(node_id = %self.id, "🔑 Resume configurado ({}s)", self.settings.resume_timeout);
                }
                Err(e) => warn!(node_id = %self.id, "No se pudo serializar configureResuming: {}", e),
            }
        }

        let (writer, mut outgoing) = mpsc::unbounded_channel::<Outgoing>();
        let reconnected = self.connected_once.swap(true, Ordering::SeqCst);
        let flushed = {
            let mut link = self.link.lock();
            let flushed = link.pending.len();
            for queued in link.pending.drain(..) {
                // El receptor sigue vivo en este scope
                let _ = writer.send(queued);
            }
            link.writer = Some(writer);
            self.set_state(NodeState::Connected);
            flushed
        };

        if resumed {
            info!(node_id = %self.id, "♻️ Sesión reanudada en {}", self.options.url);
        } else if reconnected {
            warn!(node_id = %self.id, "⚠️ {} reconectó sin reanudar la sesión, recuperando reproductores", self.options.url);
            self.signal(NodeSignal::SessionLost(self.id));
        } else {
            info!(node_id = %self.id, "✅ Conectado a {}", self.options.url);
        }
        if flushed > 0 {
            debug!(node_id = %self.id, "📤 {} comandos en cola enviados", flushed);
        }

        let start = tokio::time::Instant::now() + self.settings.ping_interval;
        let mut ticker = tokio::time::interval_at(start, self.settings.ping_interval);

        let closure = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break Closure::Shutdown;
                }
                Some(queued) = outgoing.recv() => {
                    match sink.send(Message::Text(queued.payload)).await {
                        Ok(()) => {
                            let _ = queued.ack.send(Ok(()));
                        }
                        Err(e) => {
                            warn!(node_id = %self.id, op = queued.op, "❌ Error enviando comando: {}", e);
                            let _ = queued.ack.send(Err(Error::ConnectionClosed));
                            break Closure::Failed(e);
                        }
                    }
                }
                _ = ticker.tick() => {
                    *self.ping_sent_at.lock() = Some(Instant::now());
                    if let Err(e) = sink.send(Message::Text(r#"{"op":"ping"}"#.to_string())).await {
                        break Closure::Failed(e);
                    }
                }
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        heard = true;
                        self.handle_text(&text);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
                            .unwrap_or((1005, String::new()));
                        break Closure::Remote { code, reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Closure::Failed(e),
                    None => break Closure::Remote { code: ABNORMAL_CLOSURE, reason: String::new() },
                },
            }
        };

        // Lo que no llegó a escribirse vuelve al frente de la cola, en orden
        let mut link = self.link.lock();
        link.writer = None;
        outgoing.close();
        let mut unsent = Vec::new();
        while let Ok(queued) = outgoing.try_recv() {
            unsent.push(queued);
        }
        for queued in unsent.into_iter().rev() {
            link.pending.push_front(queued);
        }

        (closure, heard || opened_at.elapsed() >= STABLE_UPTIME)
    }

    /// Fails in-flight loads and picks the reconnect delay.
    fn on_closed(&self, closure: Closure) -> Duration {
        self.fail_loads(|| Error::ConnectionClosed);
        *self.ping.write() = None;
        *self.ping_sent_at.lock() = None;

        let resumable = self.resume_configured.load(Ordering::SeqCst);
        self.set_state(if resumable {
            NodeState::Resuming
        } else {
            NodeState::Disconnected
        });

        match closure {
            Closure::Remote { code, reason } => {
                info!(
                    node_id = %self.id,
                    code,
                    resumable,
                    "🔌 Socket de {} cerrado: {}",
                    self.options.url,
                    if reason.is_empty() { "sin motivo" } else { reason.as_str() }
                );
                if resumable && code != ABNORMAL_CLOSURE {
                    Duration::ZERO
                } else {
                    self.settings.reconnect_base_delay
                }
            }
            Closure::Failed(e) => {
                warn!(node_id = %self.id, resumable, "❌ Error de transporte en {}: {}", self.options.url, e);
                self.settings.reconnect_base_delay
            }
            Closure::Shutdown => Duration::ZERO,
        }
    }

    fn fail_loads(&self, error: impl Fn() -> Error) {
        let nonces: Vec<String> = self.loads.iter().map(|entry| entry.key().clone()).collect();
        for nonce in nonces {
            if let Some((_, waiter)) = self.loads.remove(&nonce) {
                let _ = waiter.send(Err(error()));
            }
        }
    }

    fn fail_pending(&self, error: impl Fn() -> Error) {
        let pending: Vec<Outgoing> = {
            let mut link = self.link.lock();
            link.writer = None;
            link.pending.drain(..).collect()
        };
        for queued in pending {
            let _ = queued.ack.send(Err(error()));
        }
    }

    fn mark_fatal(&self, reason: &str) {
        // Con el lock tomado para que queue_command no encole tras el drenado
        {
            let _link = self.link.lock();
            self.fatal.store(true, Ordering::SeqCst);
        }
        self.set_state(NodeState::Disconnected);
        error!(node_id = %self.id, "💀 Nodo {} inutilizable: {}", self.options.url, reason);

        let id = self.id;
        self.fail_pending(|| Error::NodeFatal(id));
        self.fail_loads(|| Error::NodeFatal(id));
        self.signal(NodeSignal::Fatal(id));
    }

    fn teardown(&self) {
        self.set_state(NodeState::Disconnected);
        self.fail_pending(|| Error::ConnectionClosed);
        self.fail_loads(|| Error::ConnectionClosed);
        info!(node_id = %self.id, "👋 Cliente de {} detenido", self.options.url);
    }

    fn handle_text(&self, text: &str) {
        match protocol::decode(text) {
            Inbound::Frame(frame) => match *frame {
                Frame::Stats(stats) => {
                    *self.stats.write() = Some(stats);
                }
                Frame::Pong(pong) => match (pong.guild_id, pong.ping) {
                    (Some(guild_id), Some(ping)) => self.signal(NodeSignal::VoicePing {
                        node: self.id,
                        guild_id,
                        ping,
                    }),
                    _ => {
                        if let Some(sent) = self.ping_sent_at.lock().take() {
                            *self.ping.write() = Some(sent.elapsed());
                        }
                    }
                },
                Frame::LoadTracks(response) => {
                    let waiter = response
                        .nonce
                        .as_deref()
                        .and_then(|nonce| self.loads.remove(nonce));
                    match waiter {
                        Some((_, waiter)) => {
                            let _ = waiter.send(Ok(response));
                        }
                        None => info!(
                            node_id = %self.id,
                            nonce = ?response.nonce,
                            "loadTracks sin solicitud pendiente: {:?}",
                            response.identifier
                        ),
                    }
                }
                Frame::Event(event) => self.signal(NodeSignal::Event { node: self.id, event }),
            },
            Inbound::Malformed { nonce, reason } => {
                warn!(node_id = %self.id, nonce = ?nonce, "⚠️ Paquete inválido del nodo: {}", reason);
                if let Some((_, waiter)) = nonce.as_deref().and_then(|nonce| self.loads.remove(nonce)) {
                    let _ = waiter.send(Err(Error::Protocol(reason)));
                }
            }
        }
    }
}

#[async_trait]
impl AudioNode for NodeClient {
    fn id(&self) -> NodeId {
        self.id
    }

    fn region(&self) -> &str {
        &self.options.region
    }

    fn penalty(&self) -> u64 {
        self.stats.read().as_ref().map(stats::penalty).unwrap_or(0)
    }

    fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    async fn send(&self, command: Command) -> Result<()> {
        NodeClient::send(self, command).await
    }

    async fn load_tracks(&self, identifier: &str, requester: Requester) -> Result<TrackLoad> {
        NodeClient::load_tracks(self, identifier, requester).await
    }
}

fn generate_resume_key() -> String {
    let mut bytes = [0u8; 30];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Protocol(format!("invalid header value: {e}")))
}

fn is_auth_rejection(error: &Error) -> bool {
    match error {
        Error::Transport(WsError::Http(response)) => {
            matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        }
        _ => false,
    }
}

/// Exponential backoff capped at `max`, plus up to 250ms of jitter.
fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    let delay = base.saturating_mul(factor).min(max);
    delay + Duration::from_millis(fastrand::u64(0..250))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use serenity::model::id::{GuildId, UserId};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as ServerRequest, Response as ServerResponse,
    };
    use tokio_tungstenite::tungstenite::http;

    type ServerSocket = WebSocketStream<TcpStream>;

    fn client_for(url: String) -> (Arc<NodeClient>, mpsc::UnboundedReceiver<NodeSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = NodeOptions {
            url,
            password: "youshallnotpass".into(),
            ws_secure: false,
            rest_secure: false,
            region: "us".into(),
        };
        let settings = NodeSettings {
            user_id: UserId::new(1),
            client_name: "Tune test".into(),
            ping_interval: Duration::from_secs(3600),
            load_timeout: Duration::from_secs(5),
            resume_timeout: 60,
            reconnect_base_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_millis(200),
            max_reconnect_attempts: 3,
        };
        (Arc::new(NodeClient::new(NodeId(0), options, settings, tx)), rx)
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = listener.local_addr().unwrap().to_string();
        (listener, url)
    }

    async fn accept(listener: &TcpListener, resumed: bool) -> (ServerSocket, HeaderMap) {
        let (tcp, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("client connects in time")
            .unwrap();
        let captured = Arc::new(Mutex::new(HeaderMap::new()));
        let sink = Arc::clone(&captured);
        let ws = accept_hdr_async(
            tcp,
            move |request: &ServerRequest, mut response: ServerResponse| -> std::result::Result<ServerResponse, ErrorResponse> {
                *sink.lock() = request.headers().clone();
                if resumed {
                    response
                        .headers_mut()
                        .insert("session-resumed", HeaderValue::from_static("true"));
                }
                Ok(response)
            },
        )
        .await
        .unwrap();
        let headers = captured.lock().clone();
        (ws, headers)
    }

    fn stats_frame() -> String {
        json!({
            "op": "stats",
            "players": 2,
            "playingPlayers": 2,
            "uptime": 10,
            "memory": { "free": 0, "used": 0, "allocated": 0, "reservable": 0 },
            "cpu": { "cores": 2, "systemLoad": 0.0, "lavalinkLoad": 0.0 }
        })
        .to_string()
    }

    async fn next_json(ws: &mut ServerSocket) -> Value {
        loop {
            match timeout(Duration::from_secs(5), ws.next()).await.expect("frame in time") {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    }

    #[test]
    fn resume_key_is_stable_hex() {
        let (client, _signals) = client_for("127.0.0.1:1".into());
        assert_eq!(client.resume_key().len(), 60);
        assert!(client.resume_key().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(client.resume_key(), client.resume_key.as_str());
    }

    #[test]
    fn handshake_presents_resume_key_only_when_resuming() {
        let (client, _signals) = client_for("127.0.0.1:1".into());

        let fresh = client.handshake_request(false).unwrap();
        assert_eq!(fresh.headers().get("authorization").unwrap(), "youshallnotpass");
        assert_eq!(fresh.headers().get("user-id").unwrap(), "1");
        assert!(fresh.headers().get("resume-key").is_none());

        let resuming = client.handshake_request(true).unwrap();
        assert_eq!(resuming.headers().get("resume-key").unwrap(), client.resume_key());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let jitter = Duration::from_millis(250);

        let first = backoff(base, max, 1);
        assert!(first >= base && first < base + jitter);
        let third = backoff(base, max, 3);
        assert!(third >= Duration::from_secs(4) && third < Duration::from_secs(4) + jitter);
        let late = backoff(base, max, 40);
        assert!(late >= max && late < max + jitter);
    }

    #[test]
    fn penalty_without_stats_is_zero() {
        let (client, _signals) = client_for("127.0.0.1:1".into());
        assert_eq!(AudioNode::penalty(client.as_ref()), 0);
        *client.stats.write() = Some(Stats {
            playing_players: 3,
            ..Default::default()
        });
        assert_eq!(AudioNode::penalty(client.as_ref()), 3);
    }

    #[tokio::test]
    async fn queued_commands_flush_in_order_after_connect() {
        let (listener, url) = listen().await;
        let (client, _signals) = client_for(url);
        let guild = GuildId::new(1);

        let acks: Vec<_> = [
            Command::Volume { guild_id: guild, volume: 50 },
            Command::Pause { guild_id: guild, pause: true },
            Command::Stop { guild_id: guild },
        ]
        .iter()
        .map(|command| client.queue_command(command).unwrap())
        .collect();
        assert_eq!(client.pending_len(), 3);

        client.connect();
        let (mut ws, headers) = accept(&listener, false).await;
        assert_eq!(headers.get("authorization").unwrap(), "youshallnotpass");
        assert_eq!(headers.get("client-name").unwrap(), "Tune test");
        assert!(headers.get("resume-key").is_none());

        let configure = next_json(&mut ws).await;
        assert_eq!(configure["op"], "configureResuming");
        assert_eq!(configure["key"], client.resume_key());
        assert_eq!(configure["timeout"], 60);

        let mut ops = Vec::new();
        for _ in 0..3 {
            ops.push(next_json(&mut ws).await["op"].as_str().unwrap().to_string());
        }
        assert_eq!(ops, ["volume", "pause", "stop"]);

        for ack in acks {
            assert!(ack.await.unwrap().is_ok());
        }
        assert_eq!(client.state(), NodeState::Connected);
        assert_eq!(client.pending_len(), 0);
        client.shutdown();
    }

    #[tokio::test]
    async fn socket_load_resolves_by_nonce() {
        let (listener, url) = listen().await;
        let (client, _signals) = client_for(url);

        let load = tokio::spawn({
            let client = Arc::clone(&client);
            async move {
                client
                    .load_track("https://example.com/a.mp3", Requester { id: "7".into() })
                    .await
            }
        });

        client.connect();
        let (mut ws, _) = accept(&listener, false).await;
        assert_eq!(next_json(&mut ws).await["op"], "configureResuming");

        let request = next_json(&mut ws).await;
        assert_eq!(request["op"], "loadTracks");
        assert_eq!(request["identifier"], "https://example.com/a.mp3");
        assert_eq!(request["user"], json!({ "id": "7" }));
        let nonce = request["nonce"].as_str().unwrap().to_string();

        // Una respuesta con otro nonce no debe resolver la carga
        let stray = json!({ "op": "loadTracks", "nonce": "other", "loadType": "NO_MATCHES" });
        ws.send(Message::Text(stray.to_string())).await.unwrap();

        let answer = json!({
            "op": "loadTracks",
            "nonce": nonce,
            "loadType": "TRACK_LOADED",
            "tracks": [{ "track": "QAAB", "info": { "title": "A", "length": 1000 } }]
        });
        ws.send(Message::Text(answer.to_string())).await.unwrap();

        let loaded = load.await.unwrap().unwrap();
        assert_eq!(loaded.tracks.len(), 1);
        assert_eq!(loaded.tracks[0].track, "QAAB");
        assert_eq!(loaded.tracks[0].info.title, "A");
        assert_eq!(client.in_flight_loads(), 0);
        client.shutdown();
    }

    #[tokio::test]
    async fn malformed_load_response_fails_its_waiter() {
        let (listener, url) = listen().await;
        let (client, _signals) = client_for(url);

        let load = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.load_track("https://example.com/b", Requester { id: "7".into() }).await }
        });

        client.connect();
        let (mut ws, _) = accept(&listener, false).await;
        next_json(&mut ws).await;
        let nonce = next_json(&mut ws).await["nonce"].as_str().unwrap().to_string();

        let broken = json!({ "op": "loadTracks", "nonce": nonce, "loadType": "NOT_A_TYPE" });
        ws.send(Message::Text(broken.to_string())).await.unwrap();

        assert!(matches!(load.await.unwrap(), Err(Error::Protocol(_))));
        assert_eq!(client.in_flight_loads(), 0);
        client.shutdown();
    }

    #[tokio::test]
    async fn close_drains_in_flight_loads() {
        let (listener, url) = listen().await;
        let (client, _signals) = client_for(url);

        let load = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.load_track("https://example.com/c", Requester { id: "7".into() }).await }
        });

        client.connect();
        let (mut ws, _) = accept(&listener, false).await;
        next_json(&mut ws).await;
        assert_eq!(next_json(&mut ws).await["op"], "loadTracks");
        ws.close(None).await.unwrap();

        let result = timeout(Duration::from_secs(2), load).await.expect("load settles").unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert_eq!(client.in_flight_loads(), 0);
        client.shutdown();
    }

    #[tokio::test]
    async fn unconfirmed_resume_signals_session_lost() {
        let (listener, url) = listen().await;
        let (client, mut signals) = client_for(url);
        client.connect();

        let (mut first, _) = accept(&listener, false).await;
        let key = next_json(&mut first).await["key"].as_str().unwrap().to_string();
        first.close(None).await.unwrap();

        let (mut second, headers) = accept(&listener, false).await;
        assert_eq!(headers.get("resume-key").unwrap(), key.as_str());

        let signal = timeout(Duration::from_secs(2), signals.recv()).await.unwrap();
        assert!(matches!(signal, Some(NodeSignal::SessionLost(NodeId(0)))));

        // configureResuming solo se envía una vez por proceso
        assert!(timeout(Duration::from_millis(300), second.next()).await.is_err());
        client.shutdown();
    }

    #[tokio::test]
    async fn confirmed_resume_keeps_sessions() {
        let (listener, url) = listen().await;
        let (client, mut signals) = client_for(url);
        client.connect();

        let (mut first, _) = accept(&listener, false).await;
        next_json(&mut first).await;
        first.close(None).await.unwrap();

        let (_second, headers) = accept(&listener, true).await;
        assert!(headers.get("resume-key").is_some());
        assert!(timeout(Duration::from_millis(300), signals.recv()).await.is_err());
        assert_eq!(client.state(), NodeState::Connected);
        client.shutdown();
    }

    #[tokio::test]
    async fn transient_closes_reconnect_with_the_same_resume_key() {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;

        let (listener, url) = listen().await;
        let (client, _signals) = client_for(url);
        client.connect();

        let (mut socket, _) = accept(&listener, false).await;
        let key = next_json(&mut socket).await["key"].as_str().unwrap().to_string();

        for code in [CloseCode::Away, CloseCode::from(4015)] {
            // Conexión sana: el nodo habló antes de cerrar
            socket.send(Message::Text(stats_frame())).await.unwrap();
            socket
                .close(Some(CloseFrame {
                    code,
                    reason: "blip".into(),
                }))
                .await
                .unwrap();
            let (next, headers) = accept(&listener, true).await;
            assert_eq!(headers.get("resume-key").unwrap(), key.as_str());
            socket = next;
        }

        // 1006: la conexión TCP muere sin close frame.
        socket.send(Message::Text(stats_frame())).await.unwrap();
        drop(socket);
        let (_last, headers) = accept(&listener, true).await;
        assert_eq!(headers.get("resume-key").unwrap(), key.as_str());
        assert_eq!(client.resume_key(), key);
        client.shutdown();
    }

    #[tokio::test]
    async fn node_closing_on_open_backs_off_then_turns_fatal() {
        let (listener, url) = listen().await;
        let (client, mut signals) = client_for(url);
        client.connect();

        let started = tokio::time::Instant::now();
        for _ in 0..3 {
            let (mut ws, _) = accept(&listener, false).await;
            ws.close(None).await.unwrap();
        }
        // Dos esperas con backoff: 50ms y 100ms como mínimo
        assert!(started.elapsed() >= Duration::from_millis(150));

        let fatal = timeout(Duration::from_secs(2), async {
            loop {
                match signals.recv().await {
                    Some(NodeSignal::Fatal(id)) => return id,
                    Some(_) => continue,
                    None => panic!("signals closed"),
                }
            }
        })
        .await
        .expect("node turns fatal");
        assert_eq!(fatal, NodeId(0));
        assert!(AudioNode::is_fatal(client.as_ref()));

        // Ya no hay más intentos
        assert!(timeout(Duration::from_millis(500), listener.accept()).await.is_err());
    }

    #[tokio::test]
    async fn rejected_handshake_is_fatal() {
        let (listener, url) = listen().await;
        let (client, mut signals) = client_for(url);
        client.connect();

        let (tcp, _) = listener.accept().await.unwrap();
        let _ = accept_hdr_async(
            tcp,
            |_: &ServerRequest, _: ServerResponse| -> std::result::Result<ServerResponse, ErrorResponse> {
                Err(http::Response::builder()
                    .status(StatusCode::UNAUTHORIZED)
                    .body(None)
                    .unwrap())
            },
        )
        .await;

        let signal = timeout(Duration::from_secs(2), signals.recv()).await.unwrap();
        assert!(matches!(signal, Some(NodeSignal::Fatal(NodeId(0)))));
        assert!(AudioNode::is_fatal(client.as_ref()));
        assert!(matches!(
            client.queue_command(&Command::Ping),
            Err(Error::NodeFatal(NodeId(0)))
        ));
    }

    #[tokio::test]
    async fn stats_and_events_are_forwarded() {
        let (listener, url) = listen().await;
        let (client, mut signals) = client_for(url);
        client.connect();

        let (mut ws, _) = accept(&listener, false).await;
        next_json(&mut ws).await;

        ws.send(Message::Text(stats_frame())).await.unwrap();
        let ready = json!({ "op": "event", "type": "WebSocketReadyEvent", "guildId": "5" });
        ws.send(Message::Text(ready.to_string())).await.unwrap();

        let signal = timeout(Duration::from_secs(2), signals.recv()).await.unwrap();
        match signal {
            Some(NodeSignal::Event { node, event }) => {
                assert_eq!(node, NodeId(0));
                assert_eq!(event.guild_id(), GuildId::new(5));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Los frames se procesan en orden: stats ya está aplicado
        assert_eq!(client.stats().map(|s| s.playing_players), Some(2));
        client.shutdown();
    }
}
