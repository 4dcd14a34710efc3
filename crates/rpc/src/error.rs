//! RPC and transport errors.

use tether_stream::NormalizedError;

/// A convenient type alias for `Result` with `E` = [`enum@Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures of a message transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
	/// This side or the peer closed the transport.
	#[error("transport closed")]
	Closed,
	/// A receive was issued while another receive on the same endpoint was still pending.
	#[error("usage violation: concurrent receive on one endpoint")]
	ConcurrentReceive,
	/// The underlying socket reported an error.
	#[error("socket error: {0}")]
	Socket(NormalizedError),
}

/// Possible errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The transport failed.
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// The session shut down before the operation completed.
	#[error("session closed")]
	SessionClosed,
	/// The stub was disposed.
	#[error("stub disposed")]
	Disposed,
	/// An argument expected to carry a capability reference does not.
	#[error("argument is not a capability reference")]
	NotACapability,
	/// The peer's handler failed.
	#[error("{0}")]
	Remote(NormalizedError),
	/// A frame or argument could not be (de)serialized.
	#[error("frame encoding failed: {0}")]
	Frame(#[from] serde_json::Error),
	/// A configuration document could not be parsed.
	#[error("invalid configuration: {0}")]
	Config(#[from] toml::de::Error),
}

impl From<Error> for NormalizedError {
	/// Remote failures travel through unchanged; everything else becomes an `exception`.
	fn from(err: Error) -> Self {
		match err {
			Error::Remote(inner) => inner,
			other => NormalizedError::exception(&other),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn remote_errors_pass_through_normalization() {
		let remote = NormalizedError::new("bad_input", "negative count");
		assert_eq!(NormalizedError::from(Error::Remote(remote.clone())), remote);

		let local = NormalizedError::from(Error::SessionClosed);
		assert_eq!(local.kind(), tether_stream::error::EXCEPTION_KIND);
		assert_eq!(local.message(), "session closed");
	}
}
