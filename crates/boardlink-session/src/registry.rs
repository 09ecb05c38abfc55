//! Signal subscription routing
//!
//! Many logical data streams (sensor streaming, one-shot reads, pollable
//! timers) ride the board's single notification channel. The registry keys
//! listeners by signal handle, decodes each incoming frame once, and fans
//! the decoded sample out to every listener on that handle.
//!
//! Subscriptions are reference-counted per handle: the session issues the
//! board-level unsubscribe only when the last listener for a handle goes
//! away. Deliveries for handles nobody tracks are ignored, which makes the
//! window between cleanup-issued and bookkeeping-removed safe.
//!
//! The registry is mutated exclusively from the session task, so it carries
//! no locking.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use boardlink_core::engine::DataFrame;
use boardlink_core::errors::BoardError;
use boardlink_core::payload::{decode_sample, DecodedSample};
use boardlink_core::types::SignalHandle;

// ----------------------------------------------------------------------------
// Listener Types
// ----------------------------------------------------------------------------

/// How long a listener stays registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    /// Removed automatically after its first delivery (success or failure).
    OneShot,
    /// Persists until explicit unsubscribe or session teardown.
    Continuous,
}

/// Event delivered to a listener.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// A decoded sample for the subscribed handle.
    Sample(DecodedSample),
    /// Graceful end of the subscription (clean disconnect).
    Finished,
    /// The subscription ended because the session faulted, or this
    /// notification could not be decoded (one-shot listeners only).
    Failed(BoardError),
}

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

/// Receiver half returned to the subscribing operation.
#[derive(Debug)]
pub struct Subscription {
    pub token: ListenerToken,
    pub events: mpsc::UnboundedReceiver<SignalEvent>,
}

#[derive(Debug)]
struct Listener {
    token: ListenerToken,
    mode: ListenerMode,
    tx: mpsc::UnboundedSender<SignalEvent>,
}

/// What a delivery did, so the session can release board-level resources
/// when a handle loses its last listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Listeners the sample reached.
    pub delivered: usize,
    /// The handle has no listeners left after this delivery.
    pub handle_now_empty: bool,
}

// ----------------------------------------------------------------------------
// Signal Registry
// ----------------------------------------------------------------------------

/// Subscription table for the board's notification channel.
#[derive(Debug, Default)]
pub struct SignalRegistry {
    listeners: HashMap<SignalHandle, Vec<Listener>>,
    next_token: u64,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for a handle.
    pub fn subscribe(&mut self, handle: SignalHandle, mode: ListenerMode) -> Subscription {
        let token = ListenerToken(self.next_token);
        self.next_token += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .entry(handle)
            .or_default()
            .push(Listener { token, mode, tx });

        Subscription { token, events: rx }
    }

    /// Whether any listener tracks `handle`.
    pub fn is_subscribed(&self, handle: SignalHandle) -> bool {
        self.listeners.contains_key(&handle)
    }

    /// Count of registered listeners across all handles.
    pub fn active(&self) -> usize {
        self.listeners.values().map(Vec::len).sum()
    }

    /// Route one raw frame: decode once, fan out to every listener on the
    /// frame's handle. Unknown handles are a no-op.
    pub fn deliver(&mut self, frame: &DataFrame) -> DeliveryReport {
        let Some(entry) = self.listeners.get_mut(&frame.handle) else {
            debug!(handle = %frame.handle, "dropping frame for untracked handle");
            return DeliveryReport {
                delivered: 0,
                handle_now_empty: false,
            };
        };

        let mut delivered = 0;
        match decode_sample(&frame.payload, frame.type_tag, frame.epoch_millis) {
            Ok(sample) => {
                entry.retain(|listener| {
                    if listener.tx.send(SignalEvent::Sample(sample.clone())).is_err() {
                        // Receiver dropped without unsubscribing
                        return false;
                    }
                    delivered += 1;
                    listener.mode == ListenerMode::Continuous
                });
            }
            Err(err) => {
                // Scoped to this notification: one-shot listeners fail out,
                // continuous listeners skip the frame
                warn!(handle = %frame.handle, %err, "undecodable frame");
                entry.retain(|listener| {
                    if listener.mode == ListenerMode::OneShot {
                        let _ = listener.tx.send(SignalEvent::Failed(err.clone().into()));
                        delivered += 1;
                        false
                    } else {
                        !listener.tx.is_closed()
                    }
                });
            }
        }

        let handle_now_empty = entry.is_empty();
        if handle_now_empty {
            self.listeners.remove(&frame.handle);
        }
        DeliveryReport {
            delivered,
            handle_now_empty,
        }
    }

    /// Remove one listener. Returns the handle and whether it now has no
    /// listeners, so the caller can release the board-level subscription.
    /// The caller is responsible for issuing any cleanup writes *before*
    /// invoking this.
    pub fn unsubscribe(&mut self, token: ListenerToken) -> Option<(SignalHandle, bool)> {
        let handle = *self
            .listeners
            .iter()
            .find(|(_, listeners)| listeners.iter().any(|l| l.token == token))?
            .0;

        let entry = self.listeners.get_mut(&handle)?;
        entry.retain(|l| l.token != token);
        let now_empty = entry.is_empty();
        if now_empty {
            self.listeners.remove(&handle);
        }
        Some((handle, now_empty))
    }

    /// End every subscription: `reason: None` delivers `Finished` (graceful
    /// disconnect), `Some(err)` delivers `Failed` (faulted teardown). The
    /// table is cleared atomically; calling again is a no-op.
    pub fn teardown_all(&mut self, reason: Option<BoardError>) {
        for (_, listeners) in self.listeners.drain() {
            for listener in listeners {
                let event = match &reason {
                    None => SignalEvent::Finished,
                    Some(err) => SignalEvent::Failed(err.clone()),
                };
                let _ = listener.tx.send(event);
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
    use boardlink_core::payload::{DecodedValue, TypeTag};

    fn frame(handle: SignalHandle, value: u32) -> DataFrame {
        DataFrame {
            handle,
            type_tag: TypeTag::Uint32 as u8,
            epoch_millis: 1_000,
            payload: value.to_le_bytes().to_vec(),
        }
    }

    fn expect_sample(event: Option<SignalEvent>) -> DecodedSample {
        match event {
            Some(SignalEvent::Sample(sample)) => sample,
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn one_shot_listener_is_removed_after_first_delivery() {
        let mut registry = SignalRegistry::new();
        let handle = SignalHandle::new(7);
        let mut sub = registry.subscribe(handle, ListenerMode::OneShot);

        let report = registry.deliver(&frame(handle, 1));
        assert_eq!(report.delivered, 1);
        assert!(report.handle_now_empty);

        // Second delivery does not reach the listener
        let report = registry.deliver(&frame(handle, 2));
        assert_eq!(report.delivered, 0);

        let sample = expect_sample(sub.events.try_recv().ok());
        assert_eq!(sample.value, DecodedValue::Uint32(1));
        assert!(sub.events.try_recv().is_err());
    }

    #[test]
    fn fan_out_delivers_same_sample_to_all_listeners() {
        let mut registry = SignalRegistry::new();
        let handle = SignalHandle::new(3);
        let mut stream_sub = registry.subscribe(handle, ListenerMode::Continuous);
        let mut log_sub = registry.subscribe(handle, ListenerMode::Continuous);

        let report = registry.deliver(&frame(handle, 99));
        assert_eq!(report.delivered, 2);
        assert!(!report.handle_now_empty);

        let a = expect_sample(stream_sub.events.try_recv().ok());
        let b = expect_sample(log_sub.events.try_recv().ok());
        assert_eq!(a, b);
        assert_eq!(a.value, DecodedValue::Uint32(99));
    }

    #[test]
    fn deliveries_preserve_arrival_order_per_handle() {
        let mut registry = SignalRegistry::new();
        let handle = SignalHandle::new(4);
        let mut sub = registry.subscribe(handle, ListenerMode::Continuous);

        for value in [10, 20, 30] {
            registry.deliver(&frame(handle, value));
        }

        for expected in [10u32, 20, 30] {
            let sample = expect_sample(sub.events.try_recv().ok());
            assert_eq!(sample.value, DecodedValue::Uint32(expected));
        }
    }

    #[test]
    fn unknown_handle_is_a_no_op() {
        let mut registry = SignalRegistry::new();
        let report = registry.deliver(&frame(SignalHandle::new(42), 5));
        assert_eq!(report.delivered, 0);
        assert!(!report.handle_now_empty);
    }

    #[test]
    fn unsubscribe_reports_last_listener_removal() {
        let mut registry = SignalRegistry::new();
        let handle = SignalHandle::new(6);
        let first = registry.subscribe(handle, ListenerMode::Continuous);
        let second = registry.subscribe(handle, ListenerMode::Continuous);

        assert_eq!(registry.unsubscribe(first.token), Some((handle, false)));
        assert_eq!(registry.unsubscribe(second.token), Some((handle, true)));
        assert_eq!(registry.unsubscribe(second.token), None);
        assert!(!registry.is_subscribed(handle));
    }

    #[test]
    fn decode_failure_is_scoped_to_the_notification() {
        let mut registry = SignalRegistry::new();
        let handle = SignalHandle::new(8);
        let mut one_shot = registry.subscribe(handle, ListenerMode::OneShot);
        let mut continuous = registry.subscribe(handle, ListenerMode::Continuous);

        let bad = DataFrame {
            handle,
            type_tag: 0x7F,
            epoch_millis: 0,
            payload: vec![0, 1],
        };
        registry.deliver(&bad);

        // One-shot consumed by the failure
        assert!(matches!(
            one_shot.events.try_recv(),
            Ok(SignalEvent::Failed(_))
        ));
        // Continuous listener skipped the frame and still receives the next
        assert!(continuous.events.try_recv().is_err());
        registry.deliver(&frame(handle, 17));
        let sample = expect_sample(continuous.events.try_recv().ok());
        assert_eq!(sample.value, DecodedValue::Uint32(17));
    }

    #[test]
    fn teardown_is_terminal_and_idempotent() {
        let mut registry = SignalRegistry::new();
        let handle = SignalHandle::new(9);
        let mut graceful = registry.subscribe(handle, ListenerMode::Continuous);
        let mut one_shot = registry.subscribe(SignalHandle::new(10), ListenerMode::OneShot);

        registry.teardown_all(None);
        registry.teardown_all(None);

        assert_eq!(registry.active(), 0);
        assert!(matches!(
            graceful.events.try_recv(),
            Ok(SignalEvent::Finished)
        ));
        // Exactly one terminal event despite the double call
        assert!(graceful.events.try_recv().is_err());
        assert!(matches!(
            one_shot.events.try_recv(),
            Ok(SignalEvent::Finished)
        ));
        assert!(one_shot.events.try_recv().is_err());
    }

    #[test]
    fn faulted_teardown_delivers_failure() {
        let mut registry = SignalRegistry::new();
        let mut sub = registry.subscribe(SignalHandle::new(11), ListenerMode::Continuous);

        registry.teardown_all(Some(BoardError::link_lost("peer reset")));

        match sub.events.try_recv() {
            Ok(SignalEvent::Failed(err)) => assert!(!err.is_cancelled()),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
