//! The Stream Hub: a per-execution broadcast buffer with late-join replay
//! and per-subscriber backpressure.
//!
//! Grounded on the same bounded-fan-out shape as `oqto::ws::hub::WsHub`
//! (one producer, many per-connection `mpsc` senders kept in a map), but
//! specialized to a single execution's ordered event log instead of a
//! process-wide connection registry, and extended with ring-buffer replay
//! for late joiners and eviction of subscribers that fall behind.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Bound on the per-subscriber delivery queue.
pub const SUBSCRIBER_CAPACITY: usize = 256;

/// Bound on the number of events retained in the hub's replay buffer.
pub const MAX_BUFFER_EVENTS: usize = 10_000;

/// The kind of one unit of observable activity from the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Log,
    Display,
    Result,
    Error,
    Status,
    Artifact,
    Variables,
    /// Synthetic marker indicating the replay buffer discarded older events.
    Truncated,
}

/// One event published to an execution's Stream Hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEvent {
    pub kind: OutputKind,
    pub payload: serde_json::Value,
    pub sequence_no: u64,
    pub terminal_flag: bool,
}

impl OutputEvent {
    fn lagging(sequence_no: u64) -> Self {
        OutputEvent {
            kind: OutputKind::Error,
            payload: serde_json::json!({ "message": "subscriber fell behind" }),
            sequence_no,
            terminal_flag: true,
        }
    }

    fn truncated_marker(sequence_no: u64) -> Self {
        OutputEvent {
            kind: OutputKind::Truncated,
            payload: serde_json::json!({ "message": "older events were truncated" }),
            sequence_no,
            terminal_flag: false,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<OutputEvent>,
}

struct Inner {
    buffer: VecDeque<OutputEvent>,
    subscribers: Vec<Subscriber>,
    next_seq: u64,
    closed: bool,
    truncated: bool,
}

/// Per-execution broadcast buffer. See module docs.
pub struct StreamHub {
    inner: Mutex<Inner>,
    next_subscriber_id: AtomicU64,
}

/// A live view onto a `StreamHub`'s events, positioned at sequence 0 and
/// receiving every event up to and including the terminal one.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<OutputEvent>,
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                subscribers: Vec::new(),
                next_seq: 0,
                closed: false,
                truncated: false,
            }),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    /// Append an event to the ordered buffer and notify every current
    /// subscriber. No-ops (beyond returning a detached event) once the hub
    /// has already published a terminal event.
    pub fn publish(&self, kind: OutputKind, payload: serde_json::Value, terminal: bool) -> OutputEvent {
        let mut inner = self.inner.lock().expect("stream hub mutex poisoned");
        if inner.closed {
            return OutputEvent {
                kind,
                payload,
                sequence_no: inner.next_seq,
                terminal_flag: terminal,
            };
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let event = OutputEvent {
            kind,
            payload,
            sequence_no: seq,
            terminal_flag: terminal,
        };

        inner.buffer.push_back(event.clone());
        if inner.buffer.len() > MAX_BUFFER_EVENTS {
            inner.buffer.pop_front();
            inner.truncated = true;
        }

        inner.subscribers.retain_mut(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = sub.tx.try_send(OutputEvent::lagging(seq + 1));
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if terminal {
            inner.closed = true;
        }
        event
    }

    /// Subscribe from sequence 0: buffered events are replayed first, then
    /// future events are delivered until (and including) the terminal one.
    /// If the replay itself overflows the subscriber's queue, the
    /// subscription is handed a single lagging-error terminal event instead.
    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.inner.lock().expect("stream hub mutex poisoned");
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);

        if inner.truncated {
            let _ = tx.try_send(OutputEvent::truncated_marker(
                inner.buffer.front().map(|e| e.sequence_no).unwrap_or(0),
            ));
        }

        let mut lagged = false;
        for event in inner.buffer.iter() {
            if tx.try_send(event.clone()).is_err() {
                lagged = true;
                break;
            }
        }

        if lagged {
            let _ = tx.try_send(OutputEvent::lagging(inner.next_seq));
        } else if !inner.closed {
            inner.subscribers.push(Subscriber { id, tx });
        }

        Subscription { id, rx }
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("stream hub mutex poisoned");
        inner.subscribers.retain(|s| s.id != id);
    }

    /// True once a terminal event has been published.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("stream hub mutex poisoned").closed
    }

    /// Number of currently registered live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("stream hub mutex poisoned").subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u32) -> serde_json::Value {
        serde_json::json!({ "n": n })
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_publish_order() {
        let hub = StreamHub::new();
        hub.publish(OutputKind::Stdout, payload(0), false);
        hub.publish(OutputKind::Stdout, payload(1), false);
        let mut sub = hub.subscribe();
        hub.publish(OutputKind::Stdout, payload(2), true);

        let mut seen = Vec::new();
        while let Some(event) = sub.rx.recv().await {
            let terminal = event.terminal_flag;
            seen.push(event.sequence_no);
            if terminal {
                break;
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(hub.is_closed());
    }

    #[tokio::test]
    async fn late_subscriber_gets_full_prefix_then_terminal() {
        let hub = StreamHub::new();
        for i in 0..5 {
            hub.publish(OutputKind::Stdout, payload(i), false);
        }
        hub.publish(OutputKind::Result, payload(5), true);

        let mut sub = hub.subscribe();
        let mut seen = Vec::new();
        while let Some(event) = sub.rx.recv().await {
            seen.push(event.sequence_no);
            if event.terminal_flag {
                break;
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn no_events_admitted_after_terminal() {
        let hub = StreamHub::new();
        hub.publish(OutputKind::Stdout, payload(0), true);
        let before = hub.subscribe().rx.try_recv().unwrap();
        assert!(before.terminal_flag);

        // A publish after terminal does not extend the buffer.
        hub.publish(OutputKind::Stdout, payload(99), false);
        let mut sub = hub.subscribe();
        let mut count = 0;
        while let Ok(_event) = sub.rx.try_recv() {
            count += 1;
        }
        assert_eq!(count, 1, "buffer must not grow past the terminal event");
    }

    #[tokio::test]
    async fn slow_subscriber_is_marked_lagging_on_overflow() {
        let hub = StreamHub::new();
        let mut sub = hub.subscribe();
        for i in 0..(SUBSCRIBER_CAPACITY as u32 + 10) {
            hub.publish(OutputKind::Stdout, payload(i), false);
        }
        // Drain whatever made it through; the last message observed must be
        // the synthetic lagging error, and the hub must still be usable by
        // everyone else.
        let mut last = None;
        while let Ok(event) = sub.rx.try_recv() {
            last = Some(event);
        }
        let last = last.expect("subscriber should have received at least the lag notice");
        assert!(last.terminal_flag);
        assert_eq!(last.kind, OutputKind::Error);
        assert_eq!(hub.subscriber_count(), 0, "lagging subscriber is dropped");
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let hub = StreamHub::new();
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        hub.unsubscribe(sub.id);
        hub.unsubscribe(sub.id);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
