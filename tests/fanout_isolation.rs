//! A failing subscriber never blocks delivery to the rest.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use voxsync::error::{Result, VoxError};
use voxsync::events::PushEvent;
use voxsync::fanout::{ChannelSink, PushSink, SubscriberSet};

#[derive(Default)]
struct CountingSink {
    received: AtomicUsize,
}

impl PushSink for CountingSink {
    fn send(&self, _event: &PushEvent) -> Result<()> {
        self.received.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        false
    }
}

struct BrokenSink;

impl PushSink for BrokenSink {
    fn send(&self, event: &PushEvent) -> Result<()> {
        Err(VoxError::ChannelDelivery(format!(
            "socket reset while sending {}",
            event.kind()
        )))
    }

    fn is_closed(&self) -> bool {
        false
    }
}

#[test]
fn broken_sink_is_pruned_and_others_still_receive() {
    let set = SubscriberSet::new();
    let first = Arc::new(CountingSink::default());
    let last = Arc::new(CountingSink::default());
    set.add(Arc::clone(&first) as Arc<dyn PushSink>);
    let broken = set.add(Arc::new(BrokenSink));
    set.add(Arc::clone(&last) as Arc<dyn PushSink>);

    let report = set.broadcast(&PushEvent::Ready);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.pruned, 1);
    assert_eq!(set.len(), 2);
    assert!(!set.remove(broken));

    set.broadcast(&PushEvent::AgentStart);
    assert_eq!(first.received.load(Ordering::SeqCst), 2);
    assert_eq!(last.received.load(Ordering::SeqCst), 2);
}

#[test]
fn dropped_receiver_is_pruned_as_closed() {
    let set = SubscriberSet::new();
    let (live, mut live_rx) = ChannelSink::new(8);
    let (gone, gone_rx) = ChannelSink::new(8);
    set.add(Arc::new(live));
    set.add(Arc::new(gone));
    drop(gone_rx);

    let report = set.broadcast(&PushEvent::WorkerRestarting);
    assert_eq!(report, voxsync::fanout::BroadcastReport { delivered: 1, pruned: 1 });
    assert_eq!(live_rx.try_recv().unwrap(), PushEvent::WorkerRestarting);
    assert_eq!(set.len(), 1);
}

#[test]
fn full_queue_counts_as_failed_delivery() {
    let set = SubscriberSet::new();
    let (slow, _slow_rx) = ChannelSink::new(1);
    set.add(Arc::new(slow));

    assert_eq!(set.broadcast(&PushEvent::AgentStart).delivered, 1);
    let report = set.broadcast(&PushEvent::AgentEnd);
    assert_eq!(report.delivered, 0);
    assert_eq!(report.pruned, 1);
    assert!(set.is_empty());
}
