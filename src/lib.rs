//! # Tune Playback
//!
//! Playback orchestration core of a multi-guild music bot: per-guild voice
//! sessions, a pool of Lavalink-style audio nodes, and a persisted queue that
//! keeps advancing across reconnects, node failures and restarts.
//!
//! - [`node`] - node WebSocket client, REST helper and penalty-ranked pool
//! - [`voice`] - per-guild voice session actors
//! - [`playback`] - queue advancement on track events
//! - [`storage`] - persisted players and queues
//! - [`orchestrator`] - the registry tying them together
//! - [`bot`] - serenity event handler and gateway writer

pub mod bot;
pub mod config;
pub mod error;
pub mod node;
pub mod orchestrator;
pub mod playback;
pub mod storage;
pub mod voice;

pub use error::{Error, Result};
