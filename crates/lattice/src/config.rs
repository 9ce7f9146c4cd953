use serde::{Deserialize, Serialize};

/// Tunable protocol parameters. Everything timing- or threshold-related
/// lives here rather than in wire constants, so deployments can retune
/// without a protocol break.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Simulation ticks per second; also the outgoing packet rate.
    pub tick_rate: u32,
    /// Seconds of silence before a connection is torn down. Doubles as the
    /// history search window: frames older than this are never considered.
    pub timeout: f32,
    /// Seconds between connect-request retries while handshaking.
    pub connect_retry_interval: f32,
    /// Largest survivable distance between the processed cursor and an
    /// incoming sequence id; beyond it the peer is unrecoverably behind.
    pub max_sequence_gap: i32,
    /// Resend a still-unacked frame only after this multiple of the
    /// estimated round-trip time has passed since its last send.
    pub resend_rtt_multiple: f32,
    /// How far behind the freshest data the client renders, in seconds.
    /// Large enough that two bracketing snapshots are almost always buffered.
    pub interpolation_delay: f32,
    /// How many frames back the reliable-history scans walk at most.
    pub history_search_window: usize,
    /// Byte budget for reliable frames (resends + current) in one packet.
    pub max_message_bytes: usize,
    /// Server-side connection slot count.
    pub max_clients: usize,
}

impl NetConfig {
    /// Fixed tick interval in seconds.
    pub fn tick_dt(&self) -> f32 {
        1.0 / self.tick_rate as f32
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        let tick_rate = 60;
        Self {
            tick_rate,
            timeout: 10.0,
            connect_retry_interval: 1.0,
            max_sequence_gap: 128,
            resend_rtt_multiple: 1.5,
            interpolation_delay: 5.0 / tick_rate as f32 + 0.02,
            history_search_window: 128,
            max_message_bytes: 900,
            max_clients: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = NetConfig::default();
        assert!(config.interpolation_delay > 2.0 * config.tick_dt());
        assert!(config.max_message_bytes < 1200);
        assert!((config.tick_dt() - 1.0 / 60.0).abs() < 1e-6);
    }
}
