//! Message transport consumed by RPC sessions.

use async_trait::async_trait;

use crate::error::TransportError;

/// Ordered, message-oriented duplex channel.
///
/// A session calls `receive` from a single task, so implementations may treat a second
/// concurrent `receive` as a usage violation.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
	/// Hands one message to the peer.
	async fn send(&self, message: String) -> Result<(), TransportError>;

	/// Receives the next message. `Ok(None)` signals end-of-transport.
	async fn receive(&self) -> Result<Option<String>, TransportError>;

	/// Closes the transport. Idempotent. A pending `receive` resolves with `Ok(None)`.
	fn close(&self);
}
