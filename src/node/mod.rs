//! # Node Module
//!
//! Clients for the pooled Lavalink-style audio backends ("nodes").
//!
//! - [`client`] - one long-lived WebSocket per node: command queueing, track-load
//!   correlation, ping, resume and crash-recovery signalling
//! - [`pool`] - penalty-ranked node selection with region affinity
//! - [`protocol`] - the JSON wire frames
//! - [`rest`] - REST track loading and decoding
//! - [`stats`] - the penalty curve
//!
//! Everything above the node layer talks to nodes through the [`AudioNode`]
//! trait so sessions and the playback coordinator can run against fakes.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::model::id::{GuildId, UserId};

pub mod client;
pub mod pool;
pub mod protocol;
pub mod rest;
pub mod stats;

pub use client::{NodeClient, NodeState};
pub use pool::NodePool;

use crate::error::Result;
use protocol::{Command, Event, Requester, TrackLoad};

/// Registration-order id of a node. Persisted in player rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of the node pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOptions {
    /// `host:port`, without scheme.
    pub url: String,
    pub password: String,
    #[serde(default)]
    pub ws_secure: bool,
    #[serde(default)]
    pub rest_secure: bool,
    #[serde(default)]
    pub region: String,
}

impl NodeOptions {
    pub fn ws_url(&self) -> String {
        format!("ws{}://{}/", if self.ws_secure { "s" } else { "" }, self.url)
    }

    pub fn rest_url(&self, path: &str) -> String {
        format!("http{}://{}{}", if self.rest_secure { "s" } else { "" }, self.url, path)
    }
}

/// Timing and identity shared by every node client.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub user_id: UserId,
    pub client_name: String,
    pub ping_interval: Duration,
    pub load_timeout: Duration,
    /// Seconds the backend keeps a resumable session alive.
    pub resume_timeout: u64,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl NodeSettings {
    pub fn from_config(config: &crate::config::Config, user_id: UserId) -> Self {
        Self {
            user_id,
            client_name: format!("Tune {}", env!("CARGO_PKG_VERSION")),
            ping_interval: config.ping_interval,
            load_timeout: config.load_timeout,
            resume_timeout: config.resume_timeout_secs,
            reconnect_base_delay: config.reconnect_base_delay,
            reconnect_max_delay: config.reconnect_max_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

/// What a node reports upward to the orchestrator.
#[derive(Debug, Clone)]
pub enum NodeSignal {
    /// A player event for one guild.
    Event { node: NodeId, event: Event },
    /// Voice-gateway round trip reported by the node for one guild.
    VoicePing { node: NodeId, guild_id: GuildId, ping: i64 },
    /// The node reconnected but did not confirm a resume: every player it
    /// hosted is gone and must be rebuilt from persisted state.
    SessionLost(NodeId),
    /// The node is permanently unusable; its sessions must migrate.
    Fatal(NodeId),
}

/// The surface of a node that sessions, the pool and the coordinator use.
#[async_trait]
pub trait AudioNode: Send + Sync {
    fn id(&self) -> NodeId;

    fn region(&self) -> &str;

    /// Current load score, lower is healthier.
    fn penalty(&self) -> u64;

    fn is_fatal(&self) -> bool;

    /// Sends a command, queueing it while the socket is down.
    async fn send(&self, command: Command) -> Result<()>;

    async fn load_tracks(&self, identifier: &str, requester: Requester) -> Result<TrackLoad>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_secure_flags() {
        let options = NodeOptions {
            url: "lava.example:2333".into(),
            password: "pw".into(),
            ws_secure: true,
            rest_secure: false,
            region: "us".into(),
        };
        assert_eq!(options.ws_url(), "wss://lava.example:2333/");
        assert_eq!(options.rest_url("/loadtracks"), "http://lava.example:2333/loadtracks");
    }

    #[test]
    fn options_parse_camel_case() {
        let options: NodeOptions = serde_json::from_str(
            r#"{"url":"a:1","password":"p","wsSecure":true,"restSecure":true,"region":"brazil"}"#,
        )
        .unwrap();
        assert!(options.ws_secure && options.rest_secure);
        assert_eq!(options.region, "brazil");
    }
}
