//! In-process duplex transport.
//!
//! [`pair`] links two [`Endpoint`]s: whatever one sends, the other receives, in order. Each
//! endpoint owns an [`Inbox`], a small state machine holding either queued messages or the
//! single receiver currently waiting for one.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::TransportError;
use crate::transport::RpcTransport;

enum InboxState<M> {
	/// Nothing queued, nobody waiting.
	Idle,
	/// One receiver waits for the next message.
	Waiting(oneshot::Sender<Option<M>>),
	/// Messages wait for a receiver. Never empty.
	Queued(VecDeque<M>),
	/// The sender is gone; queued messages remain receivable.
	Draining(VecDeque<M>),
	/// End-of-transport.
	Closed,
}

enum Take<M> {
	Ready(Option<M>),
	Wait(oneshot::Receiver<Option<M>>),
}

/// Inbound side of one endpoint.
pub(crate) struct Inbox<M> {
	state: Mutex<InboxState<M>>,
}

impl<M> Inbox<M> {
	pub(crate) fn new() -> Self {
		Self {
			state: Mutex::new(InboxState::Idle),
		}
	}

	/// Hands `msg` to the waiting receiver, or queues it.
	pub(crate) fn deliver(&self, msg: M) -> Result<(), TransportError> {
		let mut state = self.state.lock();
		match std::mem::replace(&mut *state, InboxState::Idle) {
			InboxState::Idle => *state = InboxState::Queued(VecDeque::from([msg])),
			InboxState::Waiting(tx) => {
				// A receiver that gave up must not swallow the message.
				if let Err(Some(msg)) = tx.send(Some(msg)) {
					*state = InboxState::Queued(VecDeque::from([msg]));
				}
			}
			InboxState::Queued(mut queue) => {
				queue.push_back(msg);
				*state = InboxState::Queued(queue);
			}
			terminal @ (InboxState::Draining(_) | InboxState::Closed) => {
				*state = terminal;
				return Err(TransportError::Closed);
			}
		}
		Ok(())
	}

	fn take(&self) -> Result<Take<M>, TransportError> {
		let mut state = self.state.lock();
		let take = match std::mem::replace(&mut *state, InboxState::Idle) {
			InboxState::Idle => wait(&mut *state),
			InboxState::Waiting(tx) if tx.is_closed() => wait(&mut *state),
			InboxState::Waiting(tx) => {
				*state = InboxState::Waiting(tx);
				return Err(TransportError::ConcurrentReceive);
			}
			InboxState::Queued(mut queue) => match queue.pop_front() {
				Some(msg) => {
					if !queue.is_empty() {
						*state = InboxState::Queued(queue);
					}
					Take::Ready(Some(msg))
				}
				None => wait(&mut *state),
			},
			InboxState::Draining(mut queue) => {
				let msg = queue.pop_front();
				*state = if queue.is_empty() {
					InboxState::Closed
				} else {
					InboxState::Draining(queue)
				};
				Take::Ready(msg)
			}
			InboxState::Closed => {
				*state = InboxState::Closed;
				Take::Ready(None)
			}
		};
		Ok(take)
	}

	/// Receives the oldest message, waiting if none is queued.
	pub(crate) async fn receive(&self) -> Result<Option<M>, TransportError> {
		match self.take()? {
			Take::Ready(msg) => Ok(msg),
			Take::Wait(rx) => Ok(rx.await.unwrap_or(None)),
		}
	}

	/// Ends the inbox now, dropping anything queued.
	pub(crate) fn close(&self) {
		let prev = std::mem::replace(&mut *self.state.lock(), InboxState::Closed);
		if let InboxState::Waiting(tx) = prev {
			let _ = tx.send(None);
		}
	}

	/// Ends the inbox once its queued messages have been received.
	pub(crate) fn close_after_drain(&self) {
		let mut state = self.state.lock();
		*state = match std::mem::replace(&mut *state, InboxState::Closed) {
			InboxState::Waiting(tx) => {
				let _ = tx.send(None);
				InboxState::Closed
			}
			InboxState::Queued(queue) => InboxState::Draining(queue),
			InboxState::Draining(queue) => InboxState::Draining(queue),
			InboxState::Idle | InboxState::Closed => InboxState::Closed,
		};
	}

	/// True once the inbox accepts no more messages.
	pub(crate) fn is_closed(&self) -> bool {
		matches!(*self.state.lock(), InboxState::Draining(_) | InboxState::Closed)
	}
}

fn wait<M>(state: &mut InboxState<M>) -> Take<M> {
	let (tx, rx) = oneshot::channel();
	*state = InboxState::Waiting(tx);
	Take::Wait(rx)
}

/// One side of an in-process duplex transport.
pub struct Endpoint<M> {
	inbox: Arc<Inbox<M>>,
	peer: Arc<Inbox<M>>,
	closed: AtomicBool,
}

/// Creates two linked endpoints.
pub fn pair<M>() -> (Endpoint<M>, Endpoint<M>) {
	let a = Arc::new(Inbox::new());
	let b = Arc::new(Inbox::new());
	(
		Endpoint {
			inbox: Arc::clone(&a),
			peer: Arc::clone(&b),
			closed: AtomicBool::new(false),
		},
		Endpoint {
			inbox: b,
			peer: a,
			closed: AtomicBool::new(false),
		},
	)
}

impl<M> Endpoint<M> {
	/// Hands `msg` to the peer.
	///
	/// # Errors
	///
	/// [`TransportError::Closed`] once either side closed.
	pub fn send(&self, msg: M) -> Result<(), TransportError> {
		if self.is_closed() {
			return Err(TransportError::Closed);
		}
		self.peer.deliver(msg)
	}

	/// Receives the oldest unread message. `Ok(None)` signals end-of-transport.
	///
	/// # Errors
	///
	/// [`TransportError::ConcurrentReceive`] if another receive on this endpoint is still
	/// pending. A receive future that was dropped no longer counts as pending.
	pub async fn receive(&self) -> Result<Option<M>, TransportError> {
		self.inbox.receive().await
	}

	/// Closes both directions. Idempotent.
	///
	/// A receive pending on either side resolves with `Ok(None)`. Messages this side already
	/// sent stay receivable by the peer before it sees end-of-transport.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.inbox.close();
		self.peer.close_after_drain();
		trace!("rpc.duplex.closed");
	}

	/// True once this side closed.
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}
}

impl<M> Drop for Endpoint<M> {
	fn drop(&mut self) {
		self.close();
	}
}

impl<M> fmt::Debug for Endpoint<M> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Endpoint").field("closed", &self.is_closed()).finish()
	}
}

#[async_trait]
impl RpcTransport for Endpoint<String> {
	async fn send(&self, message: String) -> Result<(), TransportError> {
		Endpoint::send(self, message)
	}

	async fn receive(&self) -> Result<Option<String>, TransportError> {
		Endpoint::receive(self).await
	}

	fn close(&self) {
		Endpoint::close(self);
	}
}
