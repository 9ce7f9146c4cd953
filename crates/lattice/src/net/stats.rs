/// Per-connection traffic counters surfaced for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Smoothed round-trip estimate in seconds.
    pub rtt: f32,
    /// Bytes per half-second, folded by `NetContext::advance`.
    pub bandwidth_in: u32,
    pub bandwidth_out: u32,
}

/// Explicit per-process protocol clock and bandwidth tally, passed to every
/// entry point instead of living in globals so multiple contexts can coexist
/// in one test binary.
#[derive(Debug, Default)]
pub struct NetContext {
    pub timestamp: f64,
    bandwidth_in_counter: u32,
    bandwidth_out_counter: u32,
    pub bandwidth_in: u32,
    pub bandwidth_out: u32,
}

impl NetContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock. Bandwidth buckets fold every half second.
    pub fn advance(&mut self, dt: f64) {
        let before = self.timestamp;
        self.timestamp += dt;
        if (self.timestamp * 2.0) as i64 > (before * 2.0) as i64 {
            self.bandwidth_in = self.bandwidth_in_counter;
            self.bandwidth_out = self.bandwidth_out_counter;
            self.bandwidth_in_counter = 0;
            self.bandwidth_out_counter = 0;
        }
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.bandwidth_in_counter = self.bandwidth_in_counter.saturating_add(bytes as u32);
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.bandwidth_out_counter = self.bandwidth_out_counter.saturating_add(bytes as u32);
    }
}

/// Hash-based entropy for ping tokens and simulator seeds; good enough for
/// liveness probes, not for anything adversarial.
pub fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_folds_on_half_second() {
        let mut ctx = NetContext::new();
        ctx.record_received(100);
        ctx.record_sent(40);
        ctx.advance(0.1);
        assert_eq!(ctx.bandwidth_in, 0); // not folded yet
        ctx.advance(0.5);
        assert_eq!(ctx.bandwidth_in, 100);
        assert_eq!(ctx.bandwidth_out, 40);
    }
}
