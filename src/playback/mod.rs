//! # Playback Module
//!
//! Queue advancement driven by node track events, explicit playback
//! commands, and replay of persisted state after crashes and restarts.

pub mod coordinator;
pub mod events;

pub use coordinator::PlaybackCoordinator;
pub use events::PlaybackEvent;
