use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use dvs_flow_types::FlowEvent;

/// Create the bounded transfer ring between the estimator (producer) and the
/// sink worker (consumer).
///
/// Overwrites never occur: when the ring is full the new record is dropped
/// and the shared dropped counter incremented.
pub fn flow_ring(capacity: usize) -> (FlowSender, FlowReceiver) {
    let (tx, rx) = bounded(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        FlowSender {
            tx,
            dropped: dropped.clone(),
        },
        FlowReceiver { rx, dropped },
    )
}

/// Producer half of the flow transfer ring.
pub struct FlowSender {
    tx: Sender<FlowEvent>,
    dropped: Arc<AtomicU64>,
}

impl FlowSender {
    /// Push without blocking. Returns false (and counts a drop) when the
    /// ring is full or the consumer is gone.
    #[inline]
    pub fn try_push(&self, record: FlowEvent) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Records currently queued.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Records dropped because the ring was full.
    pub fn n_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer half of the flow transfer ring.
pub struct FlowReceiver {
    rx: Receiver<FlowEvent>,
    dropped: Arc<AtomicU64>,
}

impl FlowReceiver {
    /// Pop without blocking. A successful pop transfers ownership of the
    /// record to the caller.
    #[inline]
    pub fn try_pop(&self) -> Option<FlowEvent> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn n_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
