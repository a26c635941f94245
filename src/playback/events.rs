//! Domain events published for presentation collaborators (now-playing
//! messages, notifications). Delivered on a `tokio::sync::broadcast` channel;
//! a lagging subscriber loses old events, it never blocks playback.

use serenity::model::id::GuildId;

use crate::node::protocol::{TrackEnd, TrackException, TrackStart, TrackStuck};
use crate::node::NodeId;

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    TrackStart { node: NodeId, payload: TrackStart },
    TrackEnd { node: NodeId, payload: TrackEnd },
    TrackException { node: NodeId, payload: TrackException },
    TrackStuck { node: NodeId, payload: TrackStuck },
}

impl PlaybackEvent {
    pub fn guild_id(&self) -> GuildId {
        match self {
            PlaybackEvent::TrackStart { payload, .. } => payload.guild_id,
            PlaybackEvent::TrackEnd { payload, .. } => payload.guild_id,
            PlaybackEvent::TrackException { payload, .. } => payload.guild_id,
            PlaybackEvent::TrackStuck { payload, .. } => payload.guild_id,
        }
    }

    pub fn node(&self) -> NodeId {
        match self {
            PlaybackEvent::TrackStart { node, .. }
            | PlaybackEvent::TrackEnd { node, .. }
            | PlaybackEvent::TrackException { node, .. }
            | PlaybackEvent::TrackStuck { node, .. } => *node,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PlaybackEvent::TrackStart { .. } => "trackStart",
            PlaybackEvent::TrackEnd { .. } => "trackEnd",
            PlaybackEvent::TrackException { .. } => "trackException",
            PlaybackEvent::TrackStuck { .. } => "trackStuck",
        }
    }
}
