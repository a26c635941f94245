//! Synthetic load score used to rank nodes.
//!
//! CPU load and audio frame loss grow exponentially so a struggling node is
//! avoided quickly; playing players only add linearly. Lower is healthier.

use super::protocol::Stats;

/// Frames a node is expected to send per minute (one every 20ms).
const FRAMES_PER_MINUTE: f64 = 3000.0;

pub fn penalty(stats: &Stats) -> u64 {
    let cpu = 1.05f64.powf(100.0 * stats.cpu.system_load) * 10.0 - 10.0;

    let (deficit, nulled) = match stats.frame_stats {
        Some(frames) => {
            let deficit = 1.03f64.powf(500.0 * frames.deficit as f64 / FRAMES_PER_MINUTE) * 600.0 - 600.0;
            let nulled = (1.03f64.powf(500.0 * frames.nulled as f64 / FRAMES_PER_MINUTE) * 300.0 - 300.0) * 2.0;
            (deficit, nulled)
        }
        None => (0.0, 0.0),
    };

    let total = cpu + deficit + nulled + f64::from(stats.playing_players);
    // Las pérdidas negativas (nodos recién arrancados) no restan
    total.max(0.0).trunc() as u64
}
