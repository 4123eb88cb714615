//! Delivery counters shared by the processor and router.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters. Cheap to bump from any task.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    packets_received: AtomicU64,
    decode_failures: AtomicU64,
    protocol_errors: AtomicU64,
    deserialize_failures: AtomicU64,
    messages_completed: AtomicU64,
    messages_unrouted: AtomicU64,
    handler_invocations: AtomicU64,
    handler_failures: AtomicU64,
}

/// Point-in-time copy of `DeliveryStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub decode_failures: u64,
    pub protocol_errors: u64,
    pub deserialize_failures: u64,
    pub messages_completed: u64,
    pub messages_unrouted: u64,
    pub handler_invocations: u64,
    pub handler_failures: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet(&self) {
        bump(&self.packets_received);
    }

    pub fn record_decode_failure(&self) {
        bump(&self.decode_failures);
    }

    pub fn record_protocol_error(&self) {
        bump(&self.protocol_errors);
    }

    pub fn record_deserialize_failure(&self) {
        bump(&self.deserialize_failures);
    }

    pub fn record_completed(&self) {
        bump(&self.messages_completed);
    }

    pub fn record_unrouted(&self) {
        bump(&self.messages_unrouted);
    }

    pub fn record_handler(&self, ok: bool) {
        bump(&self.handler_invocations);
        if !ok {
            bump(&self.handler_failures);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_received: load(&self.packets_received),
            decode_failures: load(&self.decode_failures),
            protocol_errors: load(&self.protocol_errors),
            deserialize_failures: load(&self.deserialize_failures),
            messages_completed: load(&self.messages_completed),
            messages_unrouted: load(&self.messages_unrouted),
            handler_invocations: load(&self.handler_invocations),
            handler_failures: load(&self.handler_failures),
        }
    }

    /// Log a summary line. Silent until the first packet arrives.
    pub fn print_stats(&self, in_flight: usize) {
        let s = self.snapshot();
        if s.packets_received == 0 {
            return;
        }
        tracing::info!(
            packets = s.packets_received,
            decode_failures = s.decode_failures,
            protocol_errors = s.protocol_errors,
            deserialize_failures = s.deserialize_failures,
            completed = s.messages_completed,
            unrouted = s.messages_unrouted,
            handler_failures = s.handler_failures,
            in_flight,
            "delivery stats"
        );
    }
}
