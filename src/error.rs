//! Error types shared by the node client, voice sessions and the playback
//! coordinator.

use serenity::model::id::GuildId;
use thiserror::Error;

use crate::node::protocol::Severity;
use crate::node::NodeId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by the orchestration core.
///
/// Callers mostly care about three groups: [`Timeout`](Error::Timeout)
/// (the session was reset and the call must be retried explicitly),
/// transport failures (see [`Error::is_transport`], retried internally by the
/// node client) and [`LoadFailed`](Error::LoadFailed) for tracks the backend
/// could not resolve.
#[derive(Error, Debug)]
pub enum Error {
    /// Handshake, node-ready, disconnect confirmation or track-load deadline exceeded.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("node connection closed")]
    ConnectionClosed,

    /// Malformed or unexpected frame from a node.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("track load failed ({severity:?}): {message}")]
    LoadFailed { message: String, severity: Severity },

    #[error("no audio node available")]
    NoNodes,

    /// The node rejected authentication or exhausted its reconnect attempts.
    #[error("node {0} is unusable")]
    NodeFatal(NodeId),

    #[error("voice credentials are incomplete")]
    MissingVoiceData,

    #[error("no player exists for guild {0}")]
    NoPlayer(GuildId),

    #[error("voice session for guild {0} is closed")]
    SessionClosed(GuildId),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Socket-level failures that the node client recovers from on its own.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::ConnectionClosed)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_grouping() {
        assert!(Error::ConnectionClosed.is_transport());
        assert!(!Error::Timeout("voice server").is_transport());
        assert!(Error::Timeout("voice server").is_timeout());
        assert!(!Error::Protocol("bad frame".into()).is_transport());
    }

    #[test]
    fn load_failed_message_includes_severity() {
        let err = Error::LoadFailed {
            message: "video unavailable".into(),
            severity: Severity::Common,
        };
        assert_eq!(
            err.to_string(),
            "track load failed (Common): video unavailable"
        );
    }
}
