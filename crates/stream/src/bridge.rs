//! Produce-on-demand sources.
//!
//! [`ProducedSource`] turns a caller-supplied `produce` callback into a [`Source`]. Each time
//! the consumer pulls from an empty buffer, `produce` is invoked with a [`Controller`] it
//! (or anything it hands the controller to) uses to enqueue items, close, or fail the stream.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{NormalizedError, Result, StreamError};
use crate::source::Source;

/// An item handed back by [`Controller::enqueue`] because the stream no longer accepts items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream no longer accepts items")]
pub struct Rejected<T>(pub T);

enum Terminal {
	Closed,
	Errored(NormalizedError),
}

struct BridgeState<T> {
	queue: VecDeque<T>,
	terminal: Option<Terminal>,
	cancelled: bool,
}

impl<T> BridgeState<T> {
	fn accepts(&self) -> bool {
		!self.cancelled && self.terminal.is_none()
	}
}

struct Shared<T> {
	state: Mutex<BridgeState<T>>,
	readable: Notify,
}

/// Producer-side handle of a [`ProducedSource`].
pub struct Controller<T> {
	shared: Arc<Shared<T>>,
}

impl<T> Clone for Controller<T> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
		}
	}
}

impl<T> fmt::Debug for Controller<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = self.shared.state.lock();
		f.debug_struct("Controller")
			.field("queued", &state.queue.len())
			.field("accepts", &state.accepts())
			.finish()
	}
}

impl<T> Controller<T> {
	/// Buffers `value` for the consumer.
	///
	/// # Errors
	///
	/// Hands the value back once the stream is closed, errored, or cancelled.
	pub fn enqueue(&self, value: T) -> Result<(), Rejected<T>> {
		let mut state = self.shared.state.lock();
		if !state.accepts() {
			return Err(Rejected(value));
		}
		state.queue.push_back(value);
		drop(state);
		self.shared.readable.notify_one();
		Ok(())
	}

	/// Ends the stream after everything already enqueued. Returns false if the stream had
	/// already terminated or was cancelled.
	pub fn close(&self) -> bool {
		self.terminate(Terminal::Closed)
	}

	/// Fails the stream. Items still buffered are discarded. Returns false if the stream had
	/// already terminated or was cancelled.
	pub fn error(&self, err: NormalizedError) -> bool {
		self.terminate(Terminal::Errored(err))
	}

	/// True once the consumer cancelled the stream.
	pub fn is_cancelled(&self) -> bool {
		self.shared.state.lock().cancelled
	}

	fn terminate(&self, terminal: Terminal) -> bool {
		let mut state = self.shared.state.lock();
		if !state.accepts() {
			return false;
		}
		if matches!(terminal, Terminal::Errored(_)) {
			state.queue.clear();
		}
		state.terminal = Some(terminal);
		drop(state);
		self.shared.readable.notify_one();
		true
	}
}

/// [`Source`] fed by a produce callback.
pub struct ProducedSource<T, P> {
	shared: Arc<Shared<T>>,
	produce: P,
	on_cancel: Option<Box<dyn FnOnce() + Send>>,
	finished: bool,
}

impl<T, P, Fut> ProducedSource<T, P>
where
	P: FnMut(Controller<T>) -> Fut + Send,
	Fut: Future<Output = Result<(), NormalizedError>> + Send + 'static,
{
	/// Creates a source that calls `produce` on demand and `on_cancel` if the consumer
	/// cancels before the stream terminates.
	pub fn new(produce: P, on_cancel: impl FnOnce() + Send + 'static) -> Self {
		Self {
			shared: Arc::new(Shared {
				state: Mutex::new(BridgeState {
					queue: VecDeque::new(),
					terminal: None,
					cancelled: false,
				}),
				readable: Notify::new(),
			}),
			produce,
			on_cancel: Some(Box::new(on_cancel)),
			finished: false,
		}
	}
}

impl<T, P> ProducedSource<T, P> {
	/// A controller for pushing items from outside the produce callback.
	pub fn controller(&self) -> Controller<T> {
		Controller {
			shared: Arc::clone(&self.shared),
		}
	}

	/// Takes the next buffered item or terminal outcome, if any.
	fn poll_state(&mut self) -> Option<Result<Option<T>>> {
		let mut state = self.shared.state.lock();
		if let Some(value) = state.queue.pop_front() {
			return Some(Ok(Some(value)));
		}
		if state.cancelled {
			return Some(Ok(None));
		}
		let out = match state.terminal.as_ref()? {
			Terminal::Closed => Ok(None),
			Terminal::Errored(err) => Err(StreamError::Source(err.clone())),
		};
		self.finished = true;
		Some(out)
	}
}

#[async_trait]
impl<T, P, Fut> Source for ProducedSource<T, P>
where
	T: Send,
	P: FnMut(Controller<T>) -> Fut + Send,
	Fut: Future<Output = Result<(), NormalizedError>> + Send + 'static,
{
	type Item = T;

	async fn pull(&mut self) -> Result<Option<T>> {
		let shared = Arc::clone(&self.shared);
		let mut produced = false;
		loop {
			let readable = shared.readable.notified();
			if let Some(out) = self.poll_state() {
				return out;
			}
			if produced {
				readable.await;
				continue;
			}
			produced = true;
			let controller = self.controller();
			if let Err(err) = (self.produce)(controller.clone()).await {
				debug!(error = %err, "stream.bridge.produce_failed");
				controller.error(err);
			}
		}
	}

	async fn cancel(&mut self) -> Result<()> {
		let mut state = self.shared.state.lock();
		if state.cancelled || self.finished {
			return Ok(());
		}
		state.cancelled = true;
		state.queue.clear();
		drop(state);
		self.shared.readable.notify_waiters();
		if let Some(on_cancel) = self.on_cancel.take() {
			debug!("stream.bridge.cancelled");
			on_cancel();
		}
		Ok(())
	}
}
