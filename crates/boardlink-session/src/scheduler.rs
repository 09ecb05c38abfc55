//! Outbound write scheduling
//!
//! Every protocol command the session or engine issues becomes a
//! [`PendingWrite`] in a strict FIFO queue. The scheduler decides, per
//! dequeued write, which delivery mode actually goes on the air:
//!
//! - With a transport readiness callback, unacknowledged delivery is used
//!   only while the transport has granted readiness; while unready, writes
//!   are forced to acknowledged mode, which the link layer flow-controls.
//! - Without one, every `ack_every`-th write (1-indexed) is forced to
//!   acknowledged mode to bound the number of unacknowledged writes in
//!   flight.
//!
//! The scheduler's contract is "accepted into queue", not "delivered":
//! completion tracking belongs to callers, and `drain` discards without
//! notification.

use std::collections::VecDeque;

use smallvec::SmallVec;
use tracing::trace;

use boardlink_core::config::FlowControlPolicy;
use boardlink_core::gatt::CharacteristicId;
use boardlink_core::types::WriteMode;

// ----------------------------------------------------------------------------
// Write Records
// ----------------------------------------------------------------------------

/// A queued outbound write: payload, destination, and the delivery mode the
/// issuer requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub characteristic: CharacteristicId,
    pub data: Vec<u8>,
    pub mode: WriteMode,
}

/// A write released for transmission, carrying the effective delivery mode
/// after flow-control policy was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundWrite {
    pub characteristic: CharacteristicId,
    pub data: Vec<u8>,
    pub mode: WriteMode,
}

/// Batch of writes released by one scheduling tick.
pub type WriteBatch = SmallVec<[OutboundWrite; 4]>;

// ----------------------------------------------------------------------------
// Write Scheduler
// ----------------------------------------------------------------------------

/// FIFO write queue with flow-control pacing. Owned and mutated exclusively
/// by the session task.
#[derive(Debug)]
pub struct WriteScheduler {
    queue: VecDeque<PendingWrite>,
    policy: FlowControlPolicy,
    /// Writes released since the session came up.
    sent: u32,
    /// Whether the transport currently grants unacknowledged delivery.
    /// Starts true: readiness transports routinely report unready before
    /// anything has been sent, so the first write always goes out.
    ready: bool,
}

impl WriteScheduler {
    pub fn new(policy: FlowControlPolicy) -> Self {
        Self {
            queue: VecDeque::new(),
            policy,
            sent: 0,
            ready: true,
        }
    }

    /// Append a write. Never reorders or coalesces.
    pub fn enqueue(&mut self, write: PendingWrite) {
        self.queue.push_back(write);
    }

    /// Release every write the current policy allows, FIFO, applying the
    /// effective delivery mode per write. Bounded by queue length; no
    /// recursion.
    pub fn dispatch(&mut self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        while let Some(write) = self.queue.pop_front() {
            let mode = self.effective_mode(write.mode);
            if matches!(self.policy, FlowControlPolicy::ReadinessCallback)
                && mode == WriteMode::WithoutResponse
            {
                // The readiness grant covers one unacknowledged write
                self.ready = false;
            }
            self.sent = self.sent.wrapping_add(1);
            trace!(
                characteristic = %write.characteristic,
                ?mode,
                len = write.data.len(),
                "releasing write"
            );
            batch.push(OutboundWrite {
                characteristic: write.characteristic,
                data: write.data,
                mode,
            });
        }
        batch
    }

    /// Transport signalled it can accept another unacknowledged write.
    /// Returns the writes releasable now.
    pub fn on_ready_to_send(&mut self) -> WriteBatch {
        self.ready = true;
        self.dispatch()
    }

    /// Discard all queued writes without delivering them. Returns the count
    /// dropped. Callers awaiting completion are not notified here.
    pub fn drain(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn effective_mode(&self, requested: WriteMode) -> WriteMode {
        match self.policy {
            FlowControlPolicy::CountedFallback { ack_every } => {
                if ack_every > 0 && self.sent % ack_every == 0 {
                    WriteMode::WithResponse
                } else {
                    requested
                }
            }
            FlowControlPolicy::ReadinessCallback => {
                if self.ready {
                    requested
                } else {
                    WriteMode::WithResponse
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use boardlink_core::gatt::COMMAND_CHAR;

    fn write(byte: u8) -> PendingWrite {
        PendingWrite {
            characteristic: COMMAND_CHAR,
            data: vec![byte],
            mode: WriteMode::WithoutResponse,
        }
    }

    #[test]
    fn preserves_fifo_order() {
        let mut scheduler = WriteScheduler::new(FlowControlPolicy::DEFAULT_COUNTED);
        for byte in [b'A', b'B', b'C'] {
            scheduler.enqueue(write(byte));
        }

        let released: Vec<u8> = scheduler.dispatch().iter().map(|w| w.data[0]).collect();
        assert_eq!(released, vec![b'A', b'B', b'C']);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn fifo_holds_across_readiness_ticks() {
        let mut scheduler = WriteScheduler::new(FlowControlPolicy::ReadinessCallback);
        for byte in [b'A', b'B', b'C'] {
            scheduler.enqueue(write(byte));
        }

        let mut released = Vec::new();
        released.extend(scheduler.dispatch());
        while !scheduler.is_empty() {
            released.extend(scheduler.on_ready_to_send());
        }
        let order: Vec<u8> = released.iter().map(|w| w.data[0]).collect();
        assert_eq!(order, vec![b'A', b'B', b'C']);
    }

    #[test]
    fn counted_fallback_forces_every_tenth_write() {
        let mut scheduler = WriteScheduler::new(FlowControlPolicy::CountedFallback { ack_every: 10 });
        for i in 0..25u8 {
            scheduler.enqueue(write(i));
        }

        let released = scheduler.dispatch();
        assert_eq!(released.len(), 25);
        for (index, out) in released.iter().enumerate() {
            // Writes #1, #11, #21 (1-indexed) are acknowledged
            let expected = if index % 10 == 0 {
                WriteMode::WithResponse
            } else {
                WriteMode::WithoutResponse
            };
            assert_eq!(out.mode, expected, "write #{}", index + 1);
        }
    }

    #[test]
    fn readiness_grant_covers_one_unacknowledged_write() {
        let mut scheduler = WriteScheduler::new(FlowControlPolicy::ReadinessCallback);
        for byte in [1, 2, 3] {
            scheduler.enqueue(write(byte));
        }

        let released = scheduler.dispatch();
        assert_eq!(released[0].mode, WriteMode::WithoutResponse);
        // Grant consumed: the rest fall back to acknowledged delivery
        assert_eq!(released[1].mode, WriteMode::WithResponse);
        assert_eq!(released[2].mode, WriteMode::WithResponse);

        scheduler.enqueue(write(4));
        let released = scheduler.on_ready_to_send();
        assert_eq!(released[0].mode, WriteMode::WithoutResponse);
    }

    #[test]
    fn requested_acknowledged_mode_is_never_downgraded() {
        let mut scheduler = WriteScheduler::new(FlowControlPolicy::ReadinessCallback);
        scheduler.enqueue(PendingWrite {
            characteristic: COMMAND_CHAR,
            data: vec![9],
            mode: WriteMode::WithResponse,
        });
        scheduler.enqueue(write(1));

        let released = scheduler.dispatch();
        assert_eq!(released[0].mode, WriteMode::WithResponse);
        // The acknowledged write did not consume the readiness grant
        assert_eq!(released[1].mode, WriteMode::WithoutResponse);
    }

    #[test]
    fn drain_discards_without_delivering() {
        let mut scheduler = WriteScheduler::new(FlowControlPolicy::DEFAULT_COUNTED);
        for byte in 0..5u8 {
            scheduler.enqueue(write(byte));
        }

        assert_eq!(scheduler.drain(), 5);
        assert!(scheduler.is_empty());
        assert!(scheduler.dispatch().is_empty());
    }
}
