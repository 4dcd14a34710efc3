//! Cancellation primitives shared by the readers, gates, and bridges.
//!
//! Completion and cancellation race through a single compare-and-swap, so exactly one of
//! them wins on any runtime flavor. Cancelling never fails and never waits.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StreamError};

const ARMED: u8 = 0;
const SETTLED: u8 = 1;
const CANCELLED: u8 = 2;

/// One-shot guard deciding whether a completion or a cancellation happened first.
#[derive(Debug, Default)]
pub struct Settle {
	state: AtomicU8,
}

impl Settle {
	/// Creates an armed guard.
	pub const fn new() -> Self {
		Self {
			state: AtomicU8::new(ARMED),
		}
	}

	/// Claims the right to deliver a result. False once cancelled or already settled.
	pub fn try_settle(&self) -> bool {
		self.state
			.compare_exchange(ARMED, SETTLED, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	/// Marks the guard cancelled. False if a result was already delivered.
	pub fn cancel(&self) -> bool {
		self.state
			.compare_exchange(ARMED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	/// Returns true once cancelled.
	pub fn is_cancelled(&self) -> bool {
		self.state.load(Ordering::Acquire) == CANCELLED
	}
}

/// Handle returned by [`spawn_cancellable`].
#[derive(Clone)]
pub struct Canceler {
	settle: Arc<Settle>,
	token: CancellationToken,
}

impl Canceler {
	/// Cancels the operation. Returns immediately; after it returns the completion
	/// callback is guaranteed not to run.
	pub fn cancel(&self) {
		if self.settle.cancel() {
			tracing::trace!("stream.cancel.requested");
		}
		self.token.cancel();
	}

	/// Returns true if cancellation won the race against completion.
	pub fn is_cancelled(&self) -> bool {
		self.settle.is_cancelled()
	}
}

impl fmt::Debug for Canceler {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Canceler").field("settle", &self.settle).finish()
	}
}

/// Runs `fut` on the runtime and hands its output to `on_settle`, unless cancelled first.
///
/// On cancellation the future is dropped at its next suspension point, so an in-flight
/// operation's late result is discarded without reaching `on_settle`.
pub fn spawn_cancellable<F, C>(fut: F, on_settle: C) -> Canceler
where
	F: Future + Send + 'static,
	F::Output: Send,
	C: FnOnce(F::Output) + Send + 'static,
{
	let canceler = Canceler {
		settle: Arc::new(Settle::new()),
		token: CancellationToken::new(),
	};
	let settle = Arc::clone(&canceler.settle);
	let token = canceler.token.clone();
	tokio::spawn(async move {
		tokio::select! {
			biased;
			_ = token.cancelled() => {}
			out = fut => {
				if settle.try_settle() {
					on_settle(out);
				}
			}
		}
	});
	canceler
}

/// Result of an operation running detached on the runtime.
///
/// Dropping a `Pending` (or calling [`Pending::cancel`]) stops the result from being reported
/// but does not abort the operation itself.
#[must_use = "a Pending does nothing observable unless awaited"]
pub struct Pending<T> {
	state: PendingState<T>,
}

enum PendingState<T> {
	Ready(Option<Result<T>>),
	Waiting(oneshot::Receiver<Result<T>>),
}

impl<T> Pending<T> {
	/// A pending that resolves immediately.
	pub fn ready(result: Result<T>) -> Self {
		Self {
			state: PendingState::Ready(Some(result)),
		}
	}

	/// Spawns `fut` detached and reports its outcome through the returned pending.
	pub fn spawn<F>(fut: F) -> Self
	where
		F: Future<Output = Result<T>> + Send + 'static,
		T: Send + 'static,
	{
		let (tx, rx) = oneshot::channel();
		tokio::spawn(async move {
			let out = fut.await;
			if tx.send(out).is_err() {
				tracing::trace!("stream.pending.detached");
			}
		});
		Self::from_receiver(rx)
	}

	pub(crate) fn from_receiver(rx: oneshot::Receiver<Result<T>>) -> Self {
		Self {
			state: PendingState::Waiting(rx),
		}
	}

	/// Detaches from the operation. Its outcome is discarded.
	pub fn cancel(self) {}
}

// The result is only ever moved out, never pinned.
impl<T> Unpin for Pending<T> {}

impl<T> Future for Pending<T> {
	type Output = Result<T>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.get_mut();
		match &mut this.state {
			PendingState::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(StreamError::Cancelled))),
			PendingState::Waiting(rx) => Pin::new(rx)
				.poll(cx)
				.map(|out| out.unwrap_or(Err(StreamError::Cancelled))),
		}
	}
}

impl<T> fmt::Debug for Pending<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = match self.state {
			PendingState::Ready(_) => "ready",
			PendingState::Waiting(_) => "waiting",
		};
		f.debug_struct("Pending").field("state", &state).finish()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;
	use std::time::Duration;

	use super::*;

	#[test]
	fn settle_is_exclusive() {
		let settle = Settle::new();
		assert!(settle.try_settle());
		assert!(!settle.cancel());
		assert!(!settle.is_cancelled());

		let settle = Settle::new();
		assert!(settle.cancel());
		assert!(!settle.try_settle());
		assert!(settle.is_cancelled());
	}

	#[tokio::test]
	async fn spawn_cancellable_delivers_once() {
		let (tx, rx) = oneshot::channel();
		let _canceler = spawn_cancellable(async { 5 }, move |v| {
			let _ = tx.send(v);
		});
		assert_eq!(rx.await, Ok(5));
	}

	#[tokio::test]
	async fn cancelled_operation_never_settles() {
		let hits = Arc::new(AtomicUsize::new(0));
		let (release_tx, release_rx) = oneshot::channel::<()>();
		let canceler = spawn_cancellable(
			async move {
				let _ = release_rx.await;
			},
			{
				let hits = Arc::clone(&hits);
				move |()| {
					hits.fetch_add(1, Ordering::SeqCst);
				}
			},
		);
		canceler.cancel();
		assert!(canceler.is_cancelled());
		let _ = release_tx.send(());
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(hits.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn dropped_pending_does_not_abort_operation() {
		let (done_tx, done_rx) = oneshot::channel();
		let (go_tx, go_rx) = oneshot::channel::<()>();
		let pending = Pending::spawn(async move {
			let _ = go_rx.await;
			let _ = done_tx.send(());
			Ok(())
		});
		pending.cancel();
		let _ = go_tx.send(());
		tokio::time::timeout(Duration::from_millis(100), done_rx)
			.await
			.expect("operation ran to completion")
			.unwrap();
	}

	#[tokio::test]
	async fn ready_pending_resolves_immediately() {
		assert_eq!(Pending::ready(Ok(3)).await, Ok(3));
		assert_eq!(Pending::<()>::ready(Err(StreamError::Closed)).await, Err(StreamError::Closed));
	}
}
