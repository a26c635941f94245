//! JSON frames spoken over a node WebSocket.
//!
//! Outbound frames are [`Command`]s tagged by `op`. Inbound frames decode into
//! [`Frame`]; player events carry a second `type` tag. The `track` strings are
//! opaque backend blobs and are never inspected here.

use std::num::NonZeroU64;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use serenity::model::id::GuildId;

/// Guild ids travel as decimal strings; some backends echo them back as numbers.
mod snowflake {
    use super::*;

    pub fn serialize<S: Serializer>(id: &GuildId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&id.get())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<GuildId, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        let raw = match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.parse::<u64>().map_err(de::Error::custom)?,
            Raw::Number(n) => n,
        };
        NonZeroU64::new(raw)
            .map(GuildId::from)
            .ok_or_else(|| de::Error::custom("guild id cannot be zero"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerPayload {
    pub token: String,
    pub endpoint: String,
}

/// Who asked for a track load; the backend echoes it inside `info.user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: String,
}

/// Optional audio filters for the `filters` op. Unset filters are omitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Filters {
    #[serde(with = "snowflake")]
    pub guild_id: GuildId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equalizer: Option<Vec<EqualizerBand>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timescale: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub karaoke: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tremolo: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_pass: Option<Value>,
}

impl Filters {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            volume: None,
            equalizer: None,
            timescale: None,
            karaoke: None,
            tremolo: None,
            rotation: None,
            low_pass: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EqualizerBand {
    pub band: u8,
    pub gain: f32,
}

/// Outbound operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    VoiceUpdate {
        #[serde(with = "snowflake")]
        guild_id: GuildId,
        session_id: String,
        event: VoiceServerPayload,
    },
    Play {
        #[serde(with = "snowflake")]
        guild_id: GuildId,
        track: String,
        start_time: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<u16>,
        pause: bool,
    },
    Stop {
        #[serde(with = "snowflake")]
        guild_id: GuildId,
    },
    Pause {
        #[serde(with = "snowflake")]
        guild_id: GuildId,
        pause: bool,
    },
    Seek {
        #[serde(with = "snowflake")]
        guild_id: GuildId,
        position: u64,
    },
    Volume {
        #[serde(with = "snowflake")]
        guild_id: GuildId,
        volume: u16,
    },
    Destroy {
        #[serde(with = "snowflake")]
        guild_id: GuildId,
    },
    ConfigureResuming {
        key: String,
        timeout: u64,
    },
    Filters(Filters),
    Ping,
    LoadTracks {
        identifier: String,
        user: Requester,
        nonce: String,
    },
}

impl Command {
    pub fn op(&self) -> &'static str {
        match self {
            Command::VoiceUpdate { .. } => "voiceUpdate",
            Command::Play { .. } => "play",
            Command::Stop { .. } => "stop",
            Command::Pause { .. } => "pause",
            Command::Seek { .. } => "seek",
            Command::Volume { .. } => "volume",
            Command::Destroy { .. } => "destroy",
            Command::ConfigureResuming { .. } => "configureResuming",
            Command::Filters(_) => "filters",
            Command::Ping => "ping",
            Command::LoadTracks { .. } => "loadTracks",
        }
    }

    pub fn guild_id(&self) -> Option<GuildId> {
        match self {
            Command::VoiceUpdate { guild_id, .. }
            | Command::Play { guild_id, .. }
            | Command::Stop { guild_id }
            | Command::Pause { guild_id, .. }
            | Command::Seek { guild_id, .. }
            | Command::Volume { guild_id, .. }
            | Command::Destroy { guild_id } => Some(*guild_id),
            Command::Filters(filters) => Some(filters.guild_id),
            Command::ConfigureResuming { .. } | Command::Ping | Command::LoadTracks { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackInfo {
    pub title: String,
    pub author: String,
    pub length: u64,
    pub identifier: String,
    pub uri: String,
    pub is_stream: bool,
    pub is_seekable: bool,
    pub source_name: Option<String>,
    pub position: u64,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub user: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Common,
    Suspicious,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    #[serde(default)]
    pub message: Option<String>,
    pub severity: Severity,
    #[serde(default)]
    pub cause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStart {
    #[serde(with = "snowflake")]
    pub guild_id: GuildId,
    pub track: String,
    #[serde(default)]
    pub info: TrackInfo,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEnd {
    #[serde(with = "snowflake")]
    pub guild_id: GuildId,
    pub track: String,
    #[serde(default)]
    pub info: TrackInfo,
    pub reason: TrackEndReason,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    #[serde(with = "snowflake")]
    pub guild_id: GuildId,
    pub track: String,
    #[serde(default)]
    pub info: TrackInfo,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exception: Option<Exception>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStuck {
    #[serde(with = "snowflake")]
    pub guild_id: GuildId,
    pub track: String,
    #[serde(default)]
    pub info: TrackInfo,
    #[serde(default)]
    pub threshold_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerUpdateState {
    pub connected: bool,
    pub ping: Option<i64>,
    pub time: u64,
    pub position: Option<u64>,
    pub volume: Option<u16>,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    #[serde(with = "snowflake")]
    pub guild_id: GuildId,
    #[serde(default)]
    pub state: PlayerUpdateState,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketClosed {
    #[serde(with = "snowflake")]
    pub guild_id: GuildId,
    pub code: u16,
    #[serde(default)]
    pub by_remote: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketReady {
    #[serde(with = "snowflake")]
    pub guild_id: GuildId,
}

/// Player events, the payload of an `op: "event"` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "TrackStartEvent")]
    TrackStart(TrackStart),
    #[serde(rename = "TrackEndEvent")]
    TrackEnd(TrackEnd),
    #[serde(rename = "TrackExceptionEvent")]
    TrackException(TrackException),
    #[serde(rename = "TrackStuckEvent")]
    TrackStuck(TrackStuck),
    #[serde(rename = "PlayerUpdateEvent")]
    PlayerUpdate(PlayerUpdate),
    #[serde(rename = "WebSocketClosedEvent")]
    WebSocketClosed(WebSocketClosed),
    #[serde(rename = "WebSocketReadyEvent")]
    WebSocketReady(WebSocketReady),
}

impl Event {
    pub fn guild_id(&self) -> GuildId {
        match self {
            Event::TrackStart(e) => e.guild_id,
            Event::TrackEnd(e) => e.guild_id,
            Event::TrackException(e) => e.guild_id,
            Event::TrackStuck(e) => e.guild_id,
            Event::PlayerUpdate(e) => e.guild_id,
            Event::WebSocketClosed(e) => e.guild_id,
            Event::WebSocketReady(e) => e.guild_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Periodic health snapshot pushed by the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Stats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Pong {
    #[serde(deserialize_with = "optional_snowflake")]
    pub guild_id: Option<GuildId>,
    pub ping: Option<i64>,
}

fn optional_snowflake<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<GuildId>, D::Error> {
    #[derive(Deserialize)]
    struct Wrapper(#[serde(with = "snowflake")] GuildId);

    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(id)| id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadType {
    TrackLoaded,
    PlaylistLoaded,
    SearchResult,
    NoMatches,
    LoadFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedTrack {
    pub track: String,
    #[serde(default)]
    pub info: TrackInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlaylistInfo {
    pub name: Option<String>,
    pub selected_track: Option<i64>,
    pub uri: Option<String>,
}

/// Result of a `loadTracks` request, socket or REST.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadTracksResponse {
    #[serde(default)]
    pub nonce: Option<String>,
    pub load_type: LoadType,
    #[serde(default)]
    pub tracks: Vec<LoadedTrack>,
    #[serde(default)]
    pub playlist_info: Option<PlaylistInfo>,
    #[serde(default)]
    pub exception: Option<Exception>,
    #[serde(default)]
    pub identifier: Option<String>,
}

/// A successful load. `LOAD_FAILED` never reaches this type.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackLoad {
    pub load_type: LoadType,
    pub tracks: Vec<LoadedTrack>,
    pub playlist: Option<PlaylistInfo>,
}

impl LoadTracksResponse {
    pub fn failed(identifier: &str, message: impl Into<String>) -> Self {
        Self {
            nonce: None,
            load_type: LoadType::LoadFailed,
            tracks: Vec::new(),
            playlist_info: None,
            exception: Some(Exception {
                message: Some(message.into()),
                severity: Severity::Suspicious,
                cause: None,
            }),
            identifier: Some(identifier.to_string()),
        }
    }

    pub fn into_result(self) -> crate::Result<TrackLoad> {
        if self.load_type == LoadType::LoadFailed {
            let (message, severity) = match self.exception {
                Some(exception) => (
                    exception.message.unwrap_or_else(|| "unknown error".to_string()),
                    exception.severity,
                ),
                None => ("unknown error".to_string(), Severity::Fault),
            };
            return Err(crate::Error::LoadFailed { message, severity });
        }

        Ok(TrackLoad {
            load_type: self.load_type,
            tracks: self.tracks,
            playlist: self.playlist_info,
        })
    }
}

/// Inbound frames, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Frame {
    Event(Event),
    Stats(Stats),
    Pong(Pong),
    LoadTracks(LoadTracksResponse),
}

/// Outcome of decoding a text frame.
#[derive(Debug)]
pub enum Inbound {
    Frame(Box<Frame>),
    /// The frame could not be decoded. `nonce` is set when the payload still
    /// identified a pending track load so its waiter can be failed.
    Malformed { nonce: Option<String>, reason: String },
}

pub fn decode(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            return Inbound::Malformed {
                nonce: None,
                reason: e.to_string(),
            }
        }
    };

    if value.get("op").and_then(Value::as_str).is_none() {
        return Inbound::Malformed {
            nonce: None,
            reason: "missing op".to_string(),
        };
    }

    let nonce = value
        .get("nonce")
        .and_then(Value::as_str)
        .map(str::to_string);

    match serde_json::from_value::<Frame>(value) {
        Ok(frame) => Inbound::Frame(Box::new(frame)),
        Err(e) => Inbound::Malformed {
            nonce,
            reason: e.to_string(),
        },
    }
}
