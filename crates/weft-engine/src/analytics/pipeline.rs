//! Bounded analytics intake with batched persistence
//!
//! Producers hand events to an [`EventSink`]; a background
//! [`AnalyticsPipeline`] worker drains the bounded queue and writes batches
//! to the persistence port in single transactions. When the queue is full
//! the sink reports backpressure - the scheduler is never blocked on event
//! emission.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use weft_core::clock::{Clock, SharedClock};
use weft_core::config::AnalyticsConfig;
use weft_core::model::AnalyticsEvent;

use crate::persistence::WorkflowStore;

/// Emission failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    /// Queue is full; the caller may drop or downgrade to a counter
    #[error("analytics queue is full")]
    Backpressure,

    /// Submission did not complete within the timeout
    #[error("analytics submit timed out")]
    Timeout,

    /// Pipeline worker has shut down
    #[error("analytics pipeline is closed")]
    Closed,
}

/// Producer handle to the intake queue
///
/// Cheap to clone; every scheduler shares one queue. `emit_sampled` is the
/// engine-facing path: under backpressure it degrades to 1-in-N sampling and
/// counts what it drops instead of ever waiting.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<AnalyticsEvent>,
    sample_every: u64,
    saturated: Arc<AtomicBool>,
    sample_counter: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Non-blocking submit
    pub fn try_emit(&self, event: AnalyticsEvent) -> Result<(), EmitError> {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.saturated.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.saturated.store(true, Ordering::Relaxed);
                Err(EmitError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EmitError::Closed),
        }
    }

    /// Blocking submit with a timeout
    pub async fn emit_timeout(
        &self,
        event: AnalyticsEvent,
        timeout: Duration,
    ) -> Result<(), EmitError> {
        match self.tx.send_timeout(event, timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(EmitError::Timeout),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(EmitError::Closed),
        }
    }

    /// Fire-and-forget submit that never blocks
    ///
    /// While saturated only every Nth event is attempted; the rest increment
    /// the drop counter.
    pub fn emit_sampled(&self, event: AnalyticsEvent) {
        let n = self.sample_counter.fetch_add(1, Ordering::Relaxed);
        if self.saturated.load(Ordering::Relaxed) && n % self.sample_every.max(1) != 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.try_emit(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped under backpressure so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events currently buffered in the queue
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Background worker draining the intake queue
///
/// Flushes when a batch fills up or when the oldest buffered event exceeds
/// the flush interval. Batches are committed atomically; a failed batch is
/// retried whole with exponential backoff up to the per-batch cap, then
/// dropped with an error log.
pub struct AnalyticsPipeline {
    store: Arc<dyn WorkflowStore>,
    config: AnalyticsConfig,
    clock: SharedClock,
    rx: mpsc::Receiver<AnalyticsEvent>,
}

/// Create the intake queue, returning the producer handle and the worker
pub fn channel(
    store: Arc<dyn WorkflowStore>,
    config: AnalyticsConfig,
    clock: SharedClock,
) -> (EventSink, AnalyticsPipeline) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let sink = EventSink {
        tx,
        sample_every: config.sample_every.max(1),
        saturated: Arc::new(AtomicBool::new(false)),
        sample_counter: Arc::new(AtomicU64::new(0)),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let pipeline = AnalyticsPipeline {
        store,
        config,
        clock,
        rx,
    };
    (sink, pipeline)
}

impl AnalyticsPipeline {
    /// Drain the queue until every sink is dropped, then flush the remainder
    pub async fn run(mut self) {
        info!(
            batch_size = self.config.batch_size,
            flush_interval_secs = self.config.flush_interval.as_secs(),
            "analytics pipeline started"
        );

        let mut batch: Vec<AnalyticsEvent> = Vec::with_capacity(self.config.batch_size);
        let mut batch_opened_at = self.clock.now();

        loop {
            if batch.is_empty() {
                match self.rx.recv().await {
                    Some(event) => {
                        batch_opened_at = self.clock.now();
                        batch.push(event);
                    }
                    None => break,
                }
                continue;
            }

            let age_deadline = batch_opened_at
                + chrono::Duration::from_std(self.config.flush_interval).unwrap_or_else(|_| chrono::Duration::zero());
            let remaining = (age_deadline - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= self.config.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = self.clock.sleep(remaining) => {
                    self.flush(&mut batch).await;
                }
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
        info!("analytics pipeline stopped");
    }

    /// Write one batch, retrying whole on failure
    async fn flush(&self, batch: &mut Vec<AnalyticsEvent>) {
        let events = std::mem::take(batch);
        if events.is_empty() {
            return;
        }

        let mut attempt = 0u32;
        loop {
            match self.store.insert_events(&events).await {
                Ok(()) => {
                    debug!(count = events.len(), "flushed analytics batch");
                    return;
                }
                Err(e) if attempt < self.config.max_batch_retries => {
                    attempt += 1;
                    let backoff = flush_backoff(attempt);
                    warn!(
                        attempt,
                        count = events.len(),
                        backoff_ms = backoff.as_millis() as u64,
                        "analytics flush failed, retrying: {}",
                        e
                    );
                    self.clock.sleep(backoff).await;
                }
                Err(e) => {
                    error!(
                        count = events.len(),
                        "analytics flush failed after {} retries, dropping batch: {}",
                        self.config.max_batch_retries,
                        e
                    );
                    return;
                }
            }
        }
    }
}

/// Exponential backoff with jitter, capped at 10 seconds
fn flush_backoff(attempt: u32) -> Duration {
    let base = 0.5 * 2f64.powi(attempt.saturating_sub(1).min(8) as i32);
    let capped = base.min(10.0);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_secs_f64(capped * jitter)
}
