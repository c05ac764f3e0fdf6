//! Per-kind sample queues between the BLE notification path and its readers.
//!
//! Every [`MeasurementKind`] gets its own unbounded FIFO. Pushing never
//! blocks, so the notification handler can return to the BLE stack straight
//! away; a slow reader only makes its own queue grow.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::trace;

use crate::data::measurement::{MeasurementKind, Sample};

struct Queue {
    tx: mpsc::UnboundedSender<Sample>,
    /// Held by the sink until a reader takes it.
    rx: Mutex<Option<mpsc::UnboundedReceiver<Sample>>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

/// Unbounded, non-blocking delivery channels, one per measurement kind.
pub struct SampleSink {
    queues: HashMap<MeasurementKind, Queue>,
}

impl SampleSink {
    /// Create a sink with a queue for every known measurement kind.
    pub fn new() -> Self {
        Self::with_kinds(MeasurementKind::ALL)
    }

    /// Create a sink with queues for the given kinds only.
    pub fn with_kinds(kinds: impl IntoIterator<Item = MeasurementKind>) -> Self {
        Self {
            queues: kinds.into_iter().map(|k| (k, Queue::new())).collect(),
        }
    }

    /// Enqueue a sample on its kind's queue.
    ///
    /// Never blocks and never fails. Samples of a kind without a queue, or
    /// whose reader has gone away, are dropped.
    pub fn push(&self, sample: Sample) {
        let kind = sample.kind();
        match self.queues.get(&kind) {
            Some(queue) => {
                if queue.tx.send(sample).is_err() {
                    trace!("Reader for {} queue dropped, discarding sample", kind);
                }
            }
            None => trace!("No queue for {}, discarding sample", kind),
        }
    }

    /// Take the reading end of a kind's queue.
    ///
    /// Each queue has a single consumer: returns `None` if the receiver was
    /// already taken or the kind has no queue. Samples pushed before the
    /// reader subscribed are still delivered.
    pub fn subscribe(&self, kind: MeasurementKind) -> Option<SampleReceiver> {
        let rx = self.queues.get(&kind)?.rx.lock().take()?;
        Some(SampleReceiver { kind, rx })
    }

    /// Drain everything currently queued for a kind.
    ///
    /// Only works while no reader has taken the queue; otherwise returns an
    /// empty list.
    pub fn drain(&self, kind: MeasurementKind) -> Vec<Sample> {
        let Some(queue) = self.queues.get(&kind) else {
            return Vec::new();
        };
        let mut guard = queue.rx.lock();
        match guard.as_mut() {
            Some(rx) => drain_receiver(rx),
            None => Vec::new(),
        }
    }

    /// Kinds this sink has queues for.
    pub fn kinds(&self) -> Vec<MeasurementKind> {
        let mut kinds: Vec<_> = self.queues.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for SampleSink {
    fn default() -> Self {
        Self::new()
    }
}

/// The reading end of one measurement kind's queue.
#[derive(Debug)]
pub struct SampleReceiver {
    kind: MeasurementKind,
    rx: mpsc::UnboundedReceiver<Sample>,
}

impl SampleReceiver {
    /// Wait for the next sample. Returns `None` once the sink is gone and
    /// the queue is empty.
    pub async fn recv(&mut self) -> Option<Sample> {
        self.rx.recv().await
    }

    /// Get the next sample if one is queued.
    pub fn try_recv(&mut self) -> Option<Sample> {
        self.rx.try_recv().ok()
    }

    /// Take every queued sample in arrival order.
    pub fn drain(&mut self) -> Vec<Sample> {
        drain_receiver(&mut self.rx)
    }

    /// The measurement kind this receiver delivers.
    pub fn kind(&self) -> MeasurementKind {
        self.kind
    }
}

fn drain_receiver(rx: &mut mpsc::UnboundedReceiver<Sample>) -> Vec<Sample> {
    let mut samples = Vec::new();
    while let Ok(sample) = rx.try_recv() {
        samples.push(sample);
    }
    samples
}
