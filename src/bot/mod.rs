//! # Bot Module
//!
//! Serenity glue. [`TuneBot`] feeds our own voice state and voice server
//! updates into the [`Orchestrator`] and replays persisted players once the
//! gateway is ready. [`SerenityGateway`] writes op-4 voice state frames to the
//! shard that owns a guild and edits our stage voice state over HTTP.

use dashmap::DashMap;
use serenity::{
    all::{Context, EventHandler, Ready, VoiceServerUpdateEvent, VoiceState},
    async_trait,
    builder::{Builder, EditVoiceState},
    gateway::ShardMessenger,
    http::Http,
    model::id::{ChannelId, GuildId},
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::voice::{VoiceGateway, VoiceServerUpdate, VoiceStateUpdate};

/// Voice gateway backed by serenity's shard runners.
pub struct SerenityGateway {
    http: Arc<Http>,
    shards: DashMap<u32, ShardMessenger>,
    shard_total: AtomicU32,
}

impl SerenityGateway {
    pub fn new(http: Arc<Http>) -> Self {
        Self {
            http,
            shards: DashMap::new(),
            shard_total: AtomicU32::new(0),
        }
    }

    /// Remembers the messenger of a shard that reached `READY`.
    pub fn register_shard(&self, shard_id: u32, total: u32, messenger: ShardMessenger) {
        self.shard_total.store(total.max(1), Ordering::SeqCst);
        self.shards.insert(shard_id, messenger);
        debug!("Shard {}/{} registrado para voz", shard_id, total);
    }
}

#[async_trait]
impl VoiceGateway for SerenityGateway {
    async fn send_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        let shard = shard_for(guild_id, self.shard_total.load(Ordering::SeqCst));
        let messenger = self
            .shards
            .get(&shard)
            .ok_or_else(|| Error::Gateway(format!("shard {shard} not ready")))?;

        let payload = voice_state_payload(guild_id, channel_id, self_mute, self_deaf);
        messenger.websocket_message(Message::Text(payload.to_string()));
        Ok(())
    }

    async fn request_to_speak(&self, guild_id: GuildId, channel_id: ChannelId, unsuppress: bool) -> Result<()> {
        let edit = if unsuppress {
            EditVoiceState::new().suppress(false)
        } else {
            EditVoiceState::new().request_to_speak(true)
        };
        edit.execute(&self.http, (guild_id, channel_id, None))
            .await
            .map_err(|e| Error::Gateway(format!("voice state edit failed: {e}")))
    }
}

/// Shard that receives a guild's events.
fn shard_for(guild_id: GuildId, total: u32) -> u32 {
    ((guild_id.get() >> 22) % u64::from(total.max(1))) as u32
}

fn voice_state_payload(
    guild_id: GuildId,
    channel_id: Option<ChannelId>,
    self_mute: bool,
    self_deaf: bool,
) -> serde_json::Value {
    serde_json::json!({
        "op": 4,
        "d": {
            "guild_id": guild_id.to_string(),
            "channel_id": channel_id.map(|id| id.to_string()),
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        }
    })
}

pub struct TuneBot {
    orchestrator: Arc<Orchestrator>,
    gateway: Arc<SerenityGateway>,
    replayed: AtomicBool,
}

impl TuneBot {
    pub fn new(orchestrator: Arc<Orchestrator>, gateway: Arc<SerenityGateway>) -> Self {
        Self {
            orchestrator,
            gateway,
            replayed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EventHandler for TuneBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        let total = ready.shard.map_or(1, |shard| shard.total);
        self.gateway.register_shard(ctx.shard_id.0, total, ctx.shard.clone());

        // Una sola vez por proceso, aunque el shard se reconecte.
        if self.replayed.swap(true, Ordering::SeqCst) {
            return;
        }
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.replay_persisted_players().await {
                error!("Error al reanudar reproductores: {:?}", e);
            }
        });
    }

    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        if new.user_id != ctx.cache.current_user().id {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };

        self.orchestrator.on_voice_state(VoiceStateUpdate {
            guild_id,
            channel_id: new.channel_id,
            session_id: new.session_id,
            suppress: new.suppress,
            request_to_speak_timestamp: new.request_to_speak_timestamp.map(|ts| ts.to_string()),
        });
    }

    async fn voice_server_update(&self, _ctx: Context, update: VoiceServerUpdateEvent) {
        let Some(guild_id) = update.guild_id else {
            return;
        };

        self.orchestrator.on_voice_server(VoiceServerUpdate {
            guild_id,
            token: update.token,
            endpoint: update.endpoint,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn guilds_map_to_their_shard() {
        // 175928847299117063 >> 22 = 41944705796
        let guild = GuildId::new(175_928_847_299_117_063);
        assert_eq!(shard_for(guild, 1), 0);
        assert_eq!(shard_for(guild, 2), (41_944_705_796u64 % 2) as u32);
        assert_eq!(shard_for(guild, 16), (41_944_705_796u64 % 16) as u32);
        assert_eq!(shard_for(guild, 0), 0);
    }

    #[test]
    fn leave_payload_has_null_channel() {
        let join = voice_state_payload(GuildId::new(1), Some(ChannelId::new(2)), false, true);
        assert_eq!(
            join,
            serde_json::json!({"op": 4, "d": {"guild_id": "1", "channel_id": "2", "self_mute": false, "self_deaf": true}})
        );

        let leave = voice_state_payload(GuildId::new(1), None, false, true);
        assert!(leave["d"]["channel_id"].is_null());
    }

    #[tokio::test]
    async fn sending_before_ready_is_a_gateway_error() {
        let gateway = SerenityGateway::new(Arc::new(Http::new("")));
        let result = gateway.send_voice_state(GuildId::new(1), None, false, true).await;
        assert!(matches!(result, Err(Error::Gateway(_))));
    }
}
