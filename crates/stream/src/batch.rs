//! Buffered, batched reads over a pull-based [`Source`].

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::StreamConfig;
use crate::error::Result;
use crate::source::Source;

/// Upper bound on up-front allocation for a single batch.
const PREALLOC_MAX: usize = 1024;

/// Bounded group of items returned by one read cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch<T> {
	/// Items in pull order.
	pub values: Vec<T>,
	/// The source reached end-of-stream during this cycle. `values` are still valid.
	pub done: bool,
}

impl<T> Batch<T> {
	fn empty(done: bool) -> Self {
		Self {
			values: Vec::new(),
			done,
		}
	}
}

/// Pulls items one at a time and hands them out in batches.
///
/// The reader owns its source exclusively for as long as it lives.
pub struct BatchReader<S: Source> {
	source: S,
	batch_size: usize,
	finished: bool,
}

impl<S: Source> BatchReader<S> {
	/// Wraps a source, using the default [`StreamConfig::batch_size`] for
	/// [`next_batch`](Self::next_batch).
	pub fn new(source: S) -> Self {
		Self::with_config(source, &StreamConfig::default())
	}

	/// Wraps a source with the batch size from `config`.
	pub fn with_config(source: S, config: &StreamConfig) -> Self {
		Self {
			source,
			batch_size: config.batch_size,
			finished: false,
		}
	}

	/// True once a batch with `done = true` has been returned.
	pub fn is_finished(&self) -> bool {
		self.finished
	}

	/// Reads up to `batch_size` items.
	///
	/// Returns a full batch with `done = false`, or whatever was pulled before end-of-stream
	/// with `done = true`. A full batch returns without pulling further, so a source ending
	/// exactly at the batch boundary reports `done` on the next call. A `batch_size` of zero
	/// never touches the source.
	///
	/// # Errors
	///
	/// Source failures are returned as-is; items pulled during this call are discarded.
	///
	/// # Cancel safety
	///
	/// Dropping the future drops the in-flight pull and the items pulled so far.
	pub async fn read_batch(&mut self, batch_size: usize) -> Result<Batch<S::Item>> {
		if batch_size == 0 {
			return Ok(Batch::empty(false));
		}
		if self.finished {
			return Ok(Batch::empty(true));
		}

		let mut values = Vec::with_capacity(batch_size.min(PREALLOC_MAX));
		while values.len() < batch_size {
			match self.source.pull().await {
				Ok(Some(value)) => values.push(value),
				Ok(None) => return Ok(self.end(values)),
				Err(err) => {
					debug!(discarded = values.len(), error = %err, "stream.batch.source_failed");
					return Err(err);
				}
			}
		}

		trace!(len = values.len(), "stream.batch.full");
		Ok(Batch { values, done: false })
	}

	fn end(&mut self, values: Vec<S::Item>) -> Batch<S::Item> {
		self.finished = true;
		debug!(len = values.len(), "stream.batch.end_of_stream");
		Batch { values, done: true }
	}

	/// Reads one batch of the configured size.
	///
	/// # Errors
	///
	/// See [`read_batch`](Self::read_batch).
	pub async fn next_batch(&mut self) -> Result<Batch<S::Item>> {
		self.read_batch(self.batch_size).await
	}

	/// Like [`read_batch`](Self::read_batch), but gives up as soon as `cancel` fires.
	///
	/// Returns `None` when cancelled: a pull that was in flight is dropped and its result,
	/// along with anything accumulated, is never delivered.
	pub async fn read_batch_until(
		&mut self,
		batch_size: usize,
		cancel: &CancellationToken,
	) -> Option<Result<Batch<S::Item>>> {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				trace!("stream.batch.cancelled");
				None
			}
			out = self.read_batch(batch_size) => Some(out),
		}
	}

	/// Cancels the underlying source. Later reads report end-of-stream.
	///
	/// # Errors
	///
	/// Propagates the source's cancellation failure.
	pub async fn cancel(&mut self) -> Result<()> {
		self.finished = true;
		self.source.cancel().await
	}

	/// Returns the source, releasing the reader's hold on it.
	pub fn into_inner(self) -> S {
		self.source
	}
}
