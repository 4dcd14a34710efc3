//! Async stream plumbing: batched pulls, flow-controlled writes, and push-to-pull bridges.
//!
//! * [`BatchReader`]: sequential, cancellable batched reads over a [`Source`]
//! * [`BackpressureGate`]: readiness-gated writes over a [`Sink`]
//! * [`ProducedSource`]: a [`Source`] fed on demand by a produce callback
//! * [`pipe`]: an in-memory writable/readable pair with bounded buffering
//! * [`normalize`]: uniform errors out of tagged error variants

#![warn(missing_docs)]

pub mod batch;
pub mod bridge;
pub mod cancel;
pub mod config;
pub mod error;
pub mod gate;
pub mod pipe;
pub mod source;

pub use batch::{Batch, BatchReader};
pub use bridge::{Controller, ProducedSource, Rejected};
pub use cancel::{Canceler, Pending, Settle, spawn_cancellable};
pub use config::StreamConfig;
pub use error::{ErrorVariant, NormalizedError, Result, StreamError, normalize};
pub use gate::BackpressureGate;
pub use source::{ChannelSink, IterSource, Sink, Source};
