//! 🪣 The Sample Buffer — where batches wait for their flush.
//!
//! Producers (the metrics engine, from whatever thread it likes) call
//! [`SampleBuffer::add`]. The flusher calls [`SampleBuffer::drain_all`] and walks
//! away with everything, leaving an empty Vec behind like a raccoon leaving an
//! empty trash can. Both sides hold the lock only long enough to push or swap.
//!
//! 🔒 `std::sync::Mutex`, not `tokio::sync::Mutex`: `add` is called from sync code
//! and nobody ever holds this lock across an `.await`.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::common::SampleBatch;

/// 🪣 Thread-safe, unbounded-until-flush collector of [`SampleBatch`]es.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    batches: Mutex<Vec<SampleBatch>>,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📥 Append one batch. Empty batches are dropped at the door.
    pub fn add(&self, batch: SampleBatch) {
        if batch.is_empty() {
            return;
        }
        self.lock().push(batch);
    }

    /// 🗑️ Atomically take every batch added since the last drain.
    ///
    /// The buffer is empty the instant this returns; anything added afterwards
    /// belongs to the next flush cycle.
    pub fn drain_all(&self) -> Vec<SampleBatch> {
        std::mem::take(&mut *self.lock())
    }

    /// 📏 Number of buffered batches (not samples). For logs and tests.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // 🩹 A panic while holding this lock can only interrupt a push or a swap,
    // so the Vec inside is still a perfectly good Vec.
    fn lock(&self) -> MutexGuard<'_, Vec<SampleBatch>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{MetricType, Sample};
    use chrono::Utc;
    use std::sync::Arc;

    fn batch_of(metric: &str, count: usize) -> SampleBatch {
        let now = Utc::now();
        SampleBatch::new(
            (0..count)
                .map(|i| Sample::new(metric, MetricType::Counter, i as f64, now))
                .collect(),
        )
    }

    #[test]
    fn the_one_where_drain_returns_exactly_what_was_added_and_leaves_nothing() {
        let buffer = SampleBuffer::new();
        buffer.add(batch_of("iterations", 2));
        buffer.add(batch_of("http_reqs", 3));

        let drained = buffer.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].samples[0].metric, "iterations");
        assert_eq!(drained[1].len(), 3);
        assert!(buffer.is_empty(), "buffer must be empty immediately after a drain");
        assert!(buffer.drain_all().is_empty());
    }

    #[test]
    fn the_one_where_empty_batches_never_make_it_past_the_bouncer() {
        let buffer = SampleBuffer::new();
        buffer.add(SampleBatch::default());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn the_one_where_many_producers_and_one_drainer_lose_nothing() {
        let buffer = Arc::new(SampleBuffer::new());
        let producers: Vec<_> = (0..8)
            .map(|p| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        buffer.add(batch_of(&format!("producer_{p}"), 1));
                    }
                })
            })
            .collect();

        // 🔄 Drain concurrently with the producers, like the flusher would.
        let mut total = 0;
        while producers.iter().any(|p| !p.is_finished()) {
            total += buffer.drain_all().iter().map(SampleBatch::len).sum::<usize>();
        }
        for producer in producers {
            producer.join().expect("producer thread panicked");
        }
        total += buffer.drain_all().iter().map(SampleBatch::len).sum::<usize>();

        assert_eq!(total, 8 * 250);
    }
}
