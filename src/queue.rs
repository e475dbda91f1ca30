use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::reading::SensorReading;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bounded FIFO between the decode path and the batch writer.
///
/// Enqueue never waits: a full queue drops the incoming reading and counts it
/// as failed. Drain pops under the same lock, so a reading is handed out at
/// most once.
#[derive(Debug)]
pub struct IngestQueue {
    inner: Mutex<VecDeque<SensorReading>>,
    capacity: usize,
    metrics: Arc<PipelineMetrics>,
}

impl IngestQueue {
    pub fn new(capacity: usize, metrics: Arc<PipelineMetrics>) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SensorReading>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the queue depth after the push.
    pub fn try_enqueue(&self, reading: SensorReading) -> Result<usize, PipelineError> {
        let depth = {
            let mut queue = self.lock();
            if queue.len() >= self.capacity {
                None
            } else {
                queue.push_back(reading);
                Some(queue.len())
            }
        };

        match depth {
            Some(depth) => {
                tracing::trace!(queue_depth = depth, "queued reading");
                Ok(depth)
            }
            None => {
                self.metrics.readings_dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.records_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(capacity = self.capacity, "ingestion queue full; dropping reading");
                Err(PipelineError::QueueOverflow {
                    capacity: self.capacity,
                })
            }
        }
    }

    pub fn drain(&self, max_batch: usize) -> Vec<SensorReading> {
        let mut queue = self.lock();
        let take = max_batch.min(queue.len());
        queue.drain(..take).collect()
    }
}
