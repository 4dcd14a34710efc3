//! Push-style socket bridge.
//!
//! Servers that receive WebSocket traffic through callbacks feed it into a [`PushSocket`] with
//! the `dispatch_*` methods. Listeners registered on the socket's [`EventBus`] observe each
//! event, and [`PushSocket::transport`] turns the event stream back into a pull-based
//! [`RpcTransport`] a session can run on.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_stream::NormalizedError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::duplex::Inbox;
use crate::error::TransportError;
use crate::events::{EventBus, ListenerId};
use crate::transport::RpcTransport;

/// Close code sent when the transport side closes the socket.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Event kinds a [`PushSocket`] dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEventKind {
	/// The connection opened.
	Open,
	/// A message arrived.
	Message,
	/// The peer closed the connection.
	Close,
	/// The connection failed.
	Error,
}

/// Event payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
	/// The connection opened.
	Open,
	/// A text message, binary frames already decoded.
	Message(String),
	/// The peer closed the connection.
	Close {
		/// WebSocket close code.
		code: u16,
		/// Close reason.
		reason: String,
	},
	/// The connection failed.
	Error(NormalizedError),
}

impl SocketEvent {
	/// The kind listeners are registered under.
	pub fn kind(&self) -> SocketEventKind {
		match self {
			Self::Open => SocketEventKind::Open,
			Self::Message(_) => SocketEventKind::Message,
			Self::Close { .. } => SocketEventKind::Close,
			Self::Error(_) => SocketEventKind::Error,
		}
	}
}

/// Incoming frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
	/// Text frame.
	Text(String),
	/// Binary frame, decoded as UTF-8 on dispatch.
	Binary(Vec<u8>),
}

impl From<String> for Payload {
	fn from(text: String) -> Self {
		Self::Text(text)
	}
}

impl From<&str> for Payload {
	fn from(text: &str) -> Self {
		Self::Text(text.to_string())
	}
}

impl From<Vec<u8>> for Payload {
	fn from(bytes: Vec<u8>) -> Self {
		Self::Binary(bytes)
	}
}

/// Commands for the real socket, drained by the server glue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
	/// Send a text frame.
	Text(String),
	/// Close the connection.
	Close {
		/// WebSocket close code.
		code: u16,
		/// Close reason.
		reason: String,
	},
}

/// Callback-driven socket with listener fan-out.
#[derive(Debug)]
pub struct PushSocket {
	events: Arc<EventBus<SocketEventKind, SocketEvent>>,
	outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl PushSocket {
	/// Creates a socket. The receiver yields what should be written to the real socket.
	pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
		let (outgoing, rx) = mpsc::unbounded_channel();
		let this = Self {
			events: Arc::new(EventBus::new()),
			outgoing,
		};
		(this, rx)
	}

	/// The listener registry.
	pub fn events(&self) -> &EventBus<SocketEventKind, SocketEvent> {
		&self.events
	}

	/// Queues a text frame for the real socket.
	///
	/// # Errors
	///
	/// [`TransportError::Closed`] once the outgoing receiver is gone.
	pub fn send(&self, text: String) -> Result<(), TransportError> {
		self.outgoing
			.send(Outgoing::Text(text))
			.map_err(|_| TransportError::Closed)
	}

	/// Asks the real socket to close.
	pub fn close(&self, code: u16, reason: impl Into<String>) {
		let _ = self.outgoing.send(Outgoing::Close {
			code,
			reason: reason.into(),
		});
	}

	/// Reports that the connection opened.
	pub fn dispatch_open(&self) {
		self.dispatch(SocketEvent::Open);
	}

	/// Reports an incoming frame. Binary frames are decoded as UTF-8, invalid sequences
	/// replaced.
	pub fn dispatch_message(&self, payload: impl Into<Payload>) {
		let text = match payload.into() {
			Payload::Text(text) => text,
			Payload::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
		};
		self.dispatch(SocketEvent::Message(text));
	}

	/// Reports that the peer closed the connection.
	pub fn dispatch_close(&self, code: u16, reason: impl Into<String>) {
		self.dispatch(SocketEvent::Close {
			code,
			reason: reason.into(),
		});
	}

	/// Reports a connection failure.
	pub fn dispatch_error(&self, error: NormalizedError) {
		self.dispatch(SocketEvent::Error(error));
	}

	fn dispatch(&self, event: SocketEvent) {
		let kind = event.kind();
		if self.events.dispatch(&kind, &event) == 0 {
			debug!(?kind, "rpc.socket.unobserved_event");
		}
	}

	/// Adapts this socket into a transport.
	///
	/// Messages dispatched from now on are queued for `receive`. A close event ends the
	/// transport after queued messages; an error event ends it with
	/// [`TransportError::Socket`].
	pub fn transport(&self) -> PushSocketTransport {
		let inbox = Arc::new(Inbox::new());
		let failure = Arc::new(Mutex::new(None));

		let on_message = self.events.add(SocketEventKind::Message, {
			let inbox = Arc::clone(&inbox);
			move |event| {
				if let SocketEvent::Message(text) = event
					&& inbox.deliver(text.clone()).is_err()
				{
					debug!("rpc.socket.message_after_close");
				}
			}
		});
		let on_close = self.events.add(SocketEventKind::Close, {
			let inbox = Arc::clone(&inbox);
			move |_| inbox.close_after_drain()
		});
		let on_error = self.events.add(SocketEventKind::Error, {
			let inbox = Arc::clone(&inbox);
			let failure = Arc::clone(&failure);
			move |event| {
				if let SocketEvent::Error(err) = event {
					warn!(error = %err, "rpc.socket.error");
					failure.lock().get_or_insert_with(|| err.clone());
				}
				inbox.close_after_drain();
			}
		});

		PushSocketTransport {
			inbox,
			failure,
			events: Arc::clone(&self.events),
			outgoing: self.outgoing.clone(),
			listeners: Mutex::new(vec![
				(SocketEventKind::Message, on_message),
				(SocketEventKind::Close, on_close),
				(SocketEventKind::Error, on_error),
			]),
		}
	}
}

/// [`RpcTransport`] over a [`PushSocket`].
pub struct PushSocketTransport {
	inbox: Arc<Inbox<String>>,
	failure: Arc<Mutex<Option<NormalizedError>>>,
	events: Arc<EventBus<SocketEventKind, SocketEvent>>,
	outgoing: mpsc::UnboundedSender<Outgoing>,
	listeners: Mutex<Vec<(SocketEventKind, ListenerId)>>,
}

impl PushSocketTransport {
	fn detach(&self) {
		for (kind, id) in self.listeners.lock().drain(..) {
			self.events.remove(&kind, id);
		}
	}
}

#[async_trait]
impl RpcTransport for PushSocketTransport {
	async fn send(&self, message: String) -> Result<(), TransportError> {
		if self.inbox.is_closed() {
			return Err(TransportError::Closed);
		}
		self.outgoing
			.send(Outgoing::Text(message))
			.map_err(|_| TransportError::Closed)
	}

	async fn receive(&self) -> Result<Option<String>, TransportError> {
		match self.inbox.receive().await? {
			Some(text) => Ok(Some(text)),
			None => match self.failure.lock().take() {
				Some(err) => Err(TransportError::Socket(err)),
				None => Ok(None),
			},
		}
	}

	fn close(&self) {
		if self.inbox.is_closed() && self.listeners.lock().is_empty() {
			return;
		}
		self.inbox.close();
		self.detach();
		let _ = self.outgoing.send(Outgoing::Close {
			code: NORMAL_CLOSURE,
			reason: String::new(),
		});
	}
}

impl Drop for PushSocketTransport {
	fn drop(&mut self) {
		self.detach();
	}
}
