//! Pending-event buffer owned by the dispatcher.
//!
//! Events wait here between detection and a delivery attempt. The buffer is
//! drained as one ordered batch on every attempt, so it never holds more than
//! one sweep's worth of events.

use tracing::debug;

use crate::event::SensorEvent;

/// Statistics about buffer operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Total number of events accepted
    pub events_received: u64,

    /// Total number of events handed out in batches
    pub events_drained: u64,
}

/// Ordered accumulator of events awaiting delivery.
#[derive(Debug, Default)]
pub struct EventBuffer {
    pending: Vec<SensorEvent>,
    stats: BufferStats,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event after everything already pending.
    pub fn push(&mut self, event: SensorEvent) {
        self.stats.events_received += 1;
        self.pending.push(event);
    }

    /// Append a batch, preserving its order.
    pub fn extend(&mut self, events: impl IntoIterator<Item = SensorEvent>) {
        for event in events {
            self.push(event);
        }
    }

    /// Take every pending event in arrival order, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<SensorEvent> {
        let batch = std::mem::take(&mut self.pending);
        self.stats.events_drained += batch.len() as u64;
        if !batch.is_empty() {
            debug!(batch_size = batch.len(), "Drained pending events");
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }
}
