//! Voice side of the chat gateway: the payloads we consume and the join/leave
//! intent we send.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serenity::model::id::{ChannelId, GuildId};

use crate::error::Result;

/// `brazil1234.discord.media:443` -> `brazil`
static REGION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([a-zA-Z]+)(?:\d+|)\.discord\.media(?::\d+|)").ok());

/// Our own voice state, as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceStateUpdate {
    pub guild_id: GuildId,
    /// `None` once the bot has left (or was removed from) voice.
    pub channel_id: Option<ChannelId>,
    pub session_id: String,
    pub suppress: bool,
    pub request_to_speak_timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceServerUpdate {
    pub guild_id: GuildId,
    pub token: String,
    /// The gateway sends `null` while it is still allocating a server.
    pub endpoint: Option<String>,
}

/// Sends the op-4 voice state that joins, moves or leaves a channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn send_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()>;

    /// Gets the bot heard in a stage channel. With `unsuppress` it lifts its
    /// own suppression, which needs moderator rights; otherwise it raises
    /// its hand.
    async fn request_to_speak(&self, guild_id: GuildId, channel_id: ChannelId, unsuppress: bool) -> Result<()>;
}

/// Region hint derived from a voice server endpoint.
pub fn region(endpoint: &str) -> Option<&str> {
    let captures = REGION.as_ref()?.captures(endpoint)?;
    captures.get(1).map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_from_endpoint() {
        assert_eq!(region("brazil1234.discord.media:443"), Some("brazil"));
        assert_eq!(region("rotterdam.discord.media"), Some("rotterdam"));
        assert_eq!(region("us-east42.discord.gg"), None);
        assert_eq!(region(""), None);
    }
}
