//! Protocol statistics collection

use std::sync::atomic::{AtomicU64, Ordering};

/// Live protocol counters
///
/// Updated by the engine's IO task and by callers submitting requests, so
/// every counter is atomic. Use [`ProtocolStatistics::snapshot`] to read a
/// consistent-enough copy for an external metrics exporter.
#[derive(Debug, Default)]
pub struct ProtocolStatistics {
    commands_sent: AtomicU64,
    responses_received: AtomicU64,
    pushes_received: AtomicU64,
    timeouts: AtomicU64,
    reconnects: AtomicU64,
    unmatched_responses: AtomicU64,
    malformed_lines: AtomicU64,
    protocol_errors: AtomicU64,
    framing_errors: AtomicU64,
}

/// Point-in-time copy of [`ProtocolStatistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    /// Command lines written to the transport
    pub commands_sent: u64,
    /// Replies matched to a pending request
    pub responses_received: u64,
    /// Push lines received
    pub pushes_received: u64,
    /// Requests completed with a timeout
    pub timeouts: u64,
    /// Successful reconnections after a connection loss
    pub reconnects: u64,
    /// Replies with no pending request to resolve
    pub unmatched_responses: u64,
    /// Lines the codec could not classify
    pub malformed_lines: u64,
    /// Error lines reported by the device
    pub protocol_errors: u64,
    /// Framing failures (oversized lines)
    pub framing_errors: u64,
}

macro_rules! counter {
    ($increment:ident, $field:ident) => {
        pub fn $increment(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl ProtocolStatistics {
    /// Create new statistics with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    counter!(increment_commands_sent, commands_sent);
    counter!(increment_responses_received, responses_received);
    counter!(increment_pushes_received, pushes_received);
    counter!(increment_reconnects, reconnects);
    counter!(increment_unmatched_responses, unmatched_responses);
    counter!(increment_malformed_lines, malformed_lines);
    counter!(increment_protocol_errors, protocol_errors);
    counter!(increment_framing_errors, framing_errors);

    /// Add `count` timed out requests
    pub fn add_timeouts(&self, count: u64) {
        self.timeouts.fetch_add(count, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            pushes_received: self.pushes_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            unmatched_responses: self.unmatched_responses.load(Ordering::Relaxed),
            malformed_lines: self.malformed_lines.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero
    pub fn clear(&self) {
        for counter in [
            &self.commands_sent,
            &self.responses_received,
            &self.pushes_received,
            &self.timeouts,
            &self.reconnects,
            &self.unmatched_responses,
            &self.malformed_lines,
            &self.protocol_errors,
            &self.framing_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ProtocolStatistics::new();
        stats.increment_commands_sent();
        stats.increment_commands_sent();
        stats.increment_unmatched_responses();
        stats.add_timeouts(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.commands_sent, 2);
        assert_eq!(snapshot.unmatched_responses, 1);
        assert_eq!(snapshot.timeouts, 3);
        assert_eq!(snapshot.pushes_received, 0);

        stats.clear();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }
}
