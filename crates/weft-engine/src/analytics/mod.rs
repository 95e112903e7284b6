//! Analytics intake pipeline
//!
//! Absorbs event bursts from the schedulers and flushes them to the
//! persistence port in batches, without ever stalling scheduling. Per-producer
//! FIFO is preserved; global ordering is not guaranteed.

mod pipeline;
mod retention;

pub use pipeline::{channel, AnalyticsPipeline, EmitError, EventSink};
pub use retention::RetentionCleaner;
