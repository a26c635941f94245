//! # Voice Module
//!
//! Per-guild voice sessions. Each guild gets one actor task that owns its
//! voice credentials and node binding; every gateway event, node event and
//! command for that guild goes through the actor's inbox and is handled
//! strictly in order.

pub mod gateway;
pub mod session;

pub use gateway::{VoiceGateway, VoiceServerUpdate, VoiceStateUpdate};
pub use session::{SessionDeps, SessionHandle, SessionSettings, SessionSnapshot, SessionState};
