//! In-memory transform pipe: a [`Sink`] whose writes come out of a [`Source`].
//!
//! The pipe holds at most `capacity` items. Writers wait for room, readers wait for items,
//! and a close is ordered after every write queued before it, so the readable side only
//! reports end-of-stream once those writes are flushed.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::config::StreamConfig;
use crate::error::{NormalizedError, Result, StreamError};
use crate::source::{Sink, Source};

struct PipeState<T> {
	queue: VecDeque<T>,
	closed: bool,
	cancelled: bool,
	aborted: Option<NormalizedError>,
}

struct PipeInner<T> {
	capacity: usize,
	state: Mutex<PipeState<T>>,
	notify_read: Notify,
	notify_write: Notify,
}

impl<T> PipeInner<T> {
	/// Checks whether the writable side may proceed.
	fn writable(&self, state: &PipeState<T>) -> Result<bool> {
		if state.cancelled {
			return Err(StreamError::Cancelled);
		}
		if state.closed || state.aborted.is_some() {
			return Err(StreamError::Closed);
		}
		Ok(state.queue.len() < self.capacity)
	}

	fn wake_all(&self) {
		self.notify_read.notify_waiters();
		self.notify_write.notify_waiters();
	}
}

/// Writable half of a pipe.
pub struct Writable<T> {
	inner: Arc<PipeInner<T>>,
}

/// Readable half of a pipe.
pub struct Readable<T> {
	inner: Arc<PipeInner<T>>,
}

/// Creates a pipe buffering at most `capacity` items.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel<T>(capacity: usize) -> (Writable<T>, Readable<T>) {
	assert!(capacity > 0, "pipe capacity must be > 0");
	let inner = Arc::new(PipeInner {
		capacity,
		state: Mutex::new(PipeState {
			queue: VecDeque::with_capacity(capacity),
			closed: false,
			cancelled: false,
			aborted: None,
		}),
		notify_read: Notify::new(),
		notify_write: Notify::new(),
	});
	(
		Writable {
			inner: Arc::clone(&inner),
		},
		Readable { inner },
	)
}

/// Creates a pipe sized by [`StreamConfig::pipe_capacity`].
pub fn from_config<T>(config: &StreamConfig) -> (Writable<T>, Readable<T>) {
	channel(config.pipe_capacity.max(1))
}

impl<T> Writable<T> {
	/// Fails the readable side with `err`. Items still buffered are discarded.
	pub fn abort(&self, err: NormalizedError) {
		let mut state = self.inner.state.lock();
		if state.closed || state.cancelled || state.aborted.is_some() {
			return;
		}
		state.queue.clear();
		state.aborted = Some(err);
		drop(state);
		self.inner.wake_all();
	}

	/// Number of buffered items.
	pub fn len(&self) -> usize {
		self.inner.state.lock().queue.len()
	}

	/// True when nothing is buffered.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait]
impl<T: Send> Sink for Writable<T> {
	type Item = T;

	async fn ready(&mut self) -> Result<()> {
		loop {
			// Register before checking to avoid a lost wakeup between unlock and await.
			let notified = self.inner.notify_write.notified();
			if self.inner.writable(&self.inner.state.lock())? {
				return Ok(());
			}
			notified.await;
		}
	}

	async fn write(&mut self, item: T) -> Result<()> {
		loop {
			let notified = self.inner.notify_write.notified();
			{
				let mut state = self.inner.state.lock();
				if self.inner.writable(&state)? {
					state.queue.push_back(item);
					drop(state);
					self.inner.notify_read.notify_one();
					return Ok(());
				}
			}
			notified.await;
		}
	}

	async fn close(&mut self) -> Result<()> {
		let mut state = self.inner.state.lock();
		if state.cancelled {
			return Err(StreamError::Cancelled);
		}
		if state.closed || state.aborted.is_some() {
			return Err(StreamError::Closed);
		}
		state.closed = true;
		trace!(flushing = state.queue.len(), "stream.pipe.closed");
		drop(state);
		self.inner.notify_read.notify_one();
		self.inner.wake_all();
		Ok(())
	}
}

impl<T> Drop for Writable<T> {
	fn drop(&mut self) {
		let mut state = self.inner.state.lock();
		if !state.closed {
			state.closed = true;
			drop(state);
			self.inner.notify_read.notify_one();
			self.inner.wake_all();
		}
	}
}

#[async_trait]
impl<T: Send> Source for Readable<T> {
	type Item = T;

	async fn pull(&mut self) -> Result<Option<T>> {
		loop {
			let notified = self.inner.notify_read.notified();
			{
				let mut state = self.inner.state.lock();
				if let Some(err) = &state.aborted {
					return Err(StreamError::Source(err.clone()));
				}
				if let Some(item) = state.queue.pop_front() {
					drop(state);
					self.inner.notify_write.notify_one();
					return Ok(Some(item));
				}
				if state.closed || state.cancelled {
					return Ok(None);
				}
			}
			notified.await;
		}
	}

	async fn cancel(&mut self) -> Result<()> {
		let mut state = self.inner.state.lock();
		if state.cancelled {
			return Ok(());
		}
		state.cancelled = true;
		state.queue.clear();
		drop(state);
		self.inner.wake_all();
		Ok(())
	}
}

impl<T> Drop for Readable<T> {
	fn drop(&mut self) {
		let mut state = self.inner.state.lock();
		if !state.cancelled {
			state.cancelled = true;
			state.queue.clear();
			drop(state);
			self.inner.wake_all();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::batch::{Batch, BatchReader};
	use crate::gate::BackpressureGate;

	#[tokio::test]
	async fn writes_flush_before_end_of_stream() {
		let (mut tx, mut rx) = channel(4);
		tx.write("a").await.unwrap();
		tx.write("b").await.unwrap();
		tx.close().await.unwrap();

		assert_eq!(rx.pull().await, Ok(Some("a")));
		assert_eq!(rx.pull().await, Ok(Some("b")));
		assert_eq!(rx.pull().await, Ok(None));
	}

	#[tokio::test]
	async fn write_waits_for_capacity() {
		let (mut tx, mut rx) = channel(1);
		tx.write(1).await.unwrap();
		assert!(
			tokio::time::timeout(Duration::from_millis(10), tx.ready()).await.is_err(),
			"full pipe is not ready"
		);

		let writer = tokio::spawn(async move {
			tx.write(2).await.unwrap();
			tx.close().await.unwrap();
		});
		assert_eq!(rx.pull().await, Ok(Some(1)));
		assert_eq!(rx.pull().await, Ok(Some(2)));
		assert_eq!(rx.pull().await, Ok(None));
		writer.await.unwrap();
	}

	#[tokio::test]
	async fn cancelled_reader_fails_writers() {
		let (mut tx, mut rx) = channel(1);
		tx.write(1).await.unwrap();
		let blocked = tokio::spawn(async move {
			let out = tx.write(2).await;
			(tx, out)
		});
		tokio::task::yield_now().await;
		rx.cancel().await.unwrap();

		let (mut tx, out) = blocked.await.unwrap();
		assert_eq!(out, Err(StreamError::Cancelled));
		assert_eq!(tx.ready().await, Err(StreamError::Cancelled));
		assert_eq!(tx.close().await, Err(StreamError::Cancelled));
	}

	#[tokio::test]
	async fn dropped_writer_ends_stream() {
		let (tx, mut rx) = channel::<u8>(2);
		drop(tx);
		assert_eq!(rx.pull().await, Ok(None));
	}

	#[tokio::test]
	async fn abort_surfaces_as_source_failure() {
		let (tx, mut rx) = channel::<u8>(2);
		tx.abort(NormalizedError::new("aborted", "writer gave up"));
		assert!(matches!(rx.pull().await, Err(StreamError::Source(e)) if e.kind() == "aborted"));
	}

	#[tokio::test]
	async fn gate_into_pipe_into_batches() {
		let (tx, rx) = from_config(&StreamConfig {
			pipe_capacity: 2,
			..StreamConfig::default()
		});
		let gate = BackpressureGate::new(tx);
		let producer = tokio::spawn(async move {
			for i in 0..5 {
				gate.write(i).await.unwrap();
			}
			gate.close().await.unwrap();
		});

		let mut reader = BatchReader::new(rx);
		let mut seen = Vec::new();
		loop {
			let Batch { values, done } = reader.read_batch(3).await.unwrap();
			assert!(values.len() <= 3);
			seen.extend(values);
			if done {
				break;
			}
		}
		producer.await.unwrap();
		assert_eq!(seen, vec![0, 1, 2, 3, 4]);
	}
}
