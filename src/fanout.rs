//! Push-channel fan-out.
//!
//! The coordinator owns one [`SubscriberSet`]. Broadcasts iterate a snapshot
//! so registrations and removals may interleave with a pass; failed or closed
//! sinks are pruned after the pass and never block delivery to the rest.

use crate::error::{Result, VoxError};
use crate::events::PushEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// One connected push-channel consumer.
pub trait PushSink: Send + Sync + 'static {
    /// Deliver one event. Must not block.
    fn send(&self, event: &PushEvent) -> Result<()>;
    fn is_closed(&self) -> bool;
}

/// Sink backed by a bounded mpsc queue (one per SSE stream).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<PushEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PushEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl PushSink for ChannelSink {
    fn send(&self, event: &PushEvent) -> Result<()> {
        self.tx
            .try_send(event.clone())
            .map_err(|e| VoxError::ChannelDelivery(format!("{} not delivered: {e}", event.kind())))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Result of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: usize,
}

/// Subscriber registry with snapshot broadcast.
#[derive(Default)]
pub struct SubscriberSet {
    sinks: Mutex<HashMap<Uuid, Arc<dyn PushSink>>>,
}

impl SubscriberSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<dyn PushSink>>> {
        // A panic inside a sink cannot leave the map half-updated.
        match self.sinks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a sink and return its id.
    pub fn add(&self, sink: Arc<dyn PushSink>) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().insert(id, sink);
        debug!(subscriber = %id, "subscriber added");
        id
    }

    /// Remove a sink. Returns `true` if it was registered.
    pub fn remove(&self, id: Uuid) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "subscriber removed");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Send a single event to one subscriber, pruning it on failure.
    pub fn send_to(&self, id: Uuid, event: &PushEvent) -> bool {
        let sink = self.lock().get(&id).cloned();
        let Some(sink) = sink else {
            return false;
        };
        match sink.send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(subscriber = %id, error = %e, "dropping subscriber");
                self.remove(id);
                false
            }
        }
    }

    /// Deliver `event` to every subscriber.
    pub fn broadcast(&self, event: &PushEvent) -> BroadcastReport {
        let snapshot: Vec<(Uuid, Arc<dyn PushSink>)> = self
            .lock()
            .iter()
            .map(|(id, sink)| (*id, Arc::clone(sink)))
            .collect();

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (id, sink) in snapshot {
            if sink.is_closed() {
                failed.push(id);
                continue;
            }
            match sink.send(event) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(subscriber = %id, error = %e, "push delivery failed");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut sinks = self.lock();
            for id in failed {
                if sinks.remove(&id).is_some() {
                    report.pruned += 1;
                }
            }
        }
        debug!(
            event = event.kind(),
            delivered = report.delivered,
            pruned = report.pruned,
            "broadcast"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing;

    impl PushSink for Failing {
        fn send(&self, _event: &PushEvent) -> Result<()> {
            Err(VoxError::ChannelDelivery("socket reset".into()))
        }
        fn is_closed(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl PushSink for Counting {
        fn send(&self, _event: &PushEvent) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn is_closed(&self) -> bool {
            false
        }
    }

    #[test]
    fn failing_subscriber_is_pruned_without_blocking_others() {
        let set = SubscriberSet::new();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        set.add(a.clone());
        set.add(Arc::new(Failing));
        set.add(b.clone());

        let report = set.broadcast(&PushEvent::Ready);
        assert_eq!(report, BroadcastReport { delivered: 2, pruned: 1 });
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 2);

        let report = set.broadcast(&PushEvent::AgentStart);
        assert_eq!(report.pruned, 0);
    }

    #[test]
    fn closed_channel_sink_is_pruned() {
        let set = SubscriberSet::new();
        let (sink, rx) = ChannelSink::new(4);
        set.add(Arc::new(sink));
        drop(rx);
        let report = set.broadcast(&PushEvent::Ready);
        assert_eq!(report, BroadcastReport { delivered: 0, pruned: 1 });
        assert!(set.is_empty());
    }

    #[test]
    fn full_channel_sink_counts_as_failed() {
        let set = SubscriberSet::new();
        let (sink, mut rx) = ChannelSink::new(1);
        set.add(Arc::new(sink));
        assert_eq!(set.broadcast(&PushEvent::Ready).delivered, 1);
        assert_eq!(set.broadcast(&PushEvent::Ready).pruned, 1);
        assert_eq!(rx.try_recv().unwrap(), PushEvent::Ready);
    }

    #[test]
    fn send_to_unknown_is_false() {
        let set = SubscriberSet::new();
        assert!(!set.send_to(Uuid::new_v4(), &PushEvent::Connected));
        let (sink, mut rx) = ChannelSink::new(2);
        let id = set.add(Arc::new(sink));
        assert!(set.send_to(id, &PushEvent::Connected));
        assert_eq!(rx.try_recv().unwrap(), PushEvent::Connected);
        assert!(set.remove(id));
        assert!(!set.remove(id));
    }
}
