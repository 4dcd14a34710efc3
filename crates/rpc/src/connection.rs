//! Client-side connection facade.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::SessionConfig;
use crate::duplex;
use crate::error::Result;
use crate::protocol::stub_ref;
use crate::session::{RpcSession, SessionStats, serve};
use crate::stub::Stub;
use crate::target::{Disposable, RpcTarget};
use crate::transport::RpcTransport;

/// Closes the session once the last connection handle sharing it lets go.
#[derive(Debug)]
struct SessionGuard(RpcSession);

impl Drop for SessionGuard {
	fn drop(&mut self) {
		self.0.close();
	}
}

/// A handle on the peer's main capability.
///
/// Handles made with [`Connection::dup`] share the session but hold their own reference, so
/// each is disposed independently. A session opened by [`Connection::connect_pair`] or
/// [`Connection::connect`] closes when the last handle sharing it is disposed or dropped.
#[derive(Debug)]
pub struct Connection {
	/// `None` for borrowed sessions and after dispose.
	guard: Mutex<Option<Arc<SessionGuard>>>,
	stub: Stub,
}

impl Connection {
	/// Links a client to a server serving `main` over an in-process duplex pair.
	///
	/// # Panics
	///
	/// Panics when called outside a tokio runtime.
	pub fn connect_pair(main: impl RpcTarget) -> Self {
		Self::connect_pair_with(Arc::new(main), &SessionConfig::default())
	}

	/// Like [`Connection::connect_pair`], with an explicit config. The two sessions are
	/// named `<name>.server` and `<name>.client`.
	///
	/// # Panics
	///
	/// Panics when called outside a tokio runtime.
	pub fn connect_pair_with(main: Arc<dyn RpcTarget>, config: &SessionConfig) -> Self {
		let (server_end, client_end) = duplex::pair::<String>();
		let server = serve(server_end, main, &config.named(format!("{}.server", config.name)));
		let client = RpcSession::new(client_end, None, &config.named(format!("{}.client", config.name)));
		let stub = client.claim_main();
		debug!(server = %server.name(), client = %client.name(), "rpc.connection.paired");
		Self::owning(client, stub)
	}

	/// Opens a client session over `transport`.
	///
	/// # Errors
	///
	/// [`Error::SessionClosed`](crate::Error::SessionClosed) if the transport ended before the
	/// session could take its first reference.
	///
	/// # Panics
	///
	/// Panics when called outside a tokio runtime.
	pub fn connect(transport: impl RpcTransport, config: &SessionConfig) -> Result<Self> {
		let session = RpcSession::new(transport, None, config);
		let stub = session.remote_main()?;
		Ok(Self::owning(session, stub))
	}

	/// Wraps an existing stub. The connection does not own the stub's session.
	pub fn from_stub(stub: Stub) -> Self {
		Self {
			guard: Mutex::new(None),
			stub,
		}
	}

	fn owning(session: RpcSession, stub: Stub) -> Self {
		Self {
			guard: Mutex::new(Some(Arc::new(SessionGuard(session)))),
			stub,
		}
	}

	/// The underlying stub.
	pub fn stub(&self) -> &Stub {
		&self.stub
	}

	/// The session this connection calls through.
	pub fn session(&self) -> &RpcSession {
		self.stub.session()
	}

	/// Calls `method` with already-encoded arguments.
	///
	/// # Errors
	///
	/// As [`Stub::call`].
	pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
		self.stub.call(method, args).await
	}

	/// Calls a method without arguments.
	///
	/// # Errors
	///
	/// As [`Stub::call`].
	pub async fn call0(&self, method: &str) -> Result<Value> {
		self.call(method, Vec::new()).await
	}

	/// Calls a method with one serializable argument.
	///
	/// # Errors
	///
	/// [`Error::Frame`](crate::Error::Frame) if the argument cannot be encoded, otherwise as
	/// [`Stub::call`].
	pub async fn call1<A: Serialize>(&self, method: &str, a: A) -> Result<Value> {
		self.call(method, vec![serde_json::to_value(a)?]).await
	}

	/// Calls a method with two serializable arguments.
	///
	/// # Errors
	///
	/// As [`Connection::call1`].
	pub async fn call2<A: Serialize, B: Serialize>(&self, method: &str, a: A, b: B) -> Result<Value> {
		self.call(method, vec![serde_json::to_value(a)?, serde_json::to_value(b)?])
			.await
	}

	/// Calls `method` passing `callback` as its only argument.
	///
	/// The callback stays exported until the peer releases it, at the latest when the
	/// session ends.
	///
	/// # Errors
	///
	/// As [`Stub::call`].
	pub async fn call_with_callback(&self, method: &str, callback: impl RpcTarget) -> Result<Value> {
		let id = self.session().export(Arc::new(callback))?;
		self.call(method, vec![stub_ref(id)]).await
	}

	/// Another handle on the same capability, disposed independently.
	///
	/// # Errors
	///
	/// As [`Stub::dup`].
	pub fn dup(&self) -> Result<Self> {
		let stub = self.stub.dup()?;
		Ok(Self {
			guard: Mutex::new(self.guard.lock().clone()),
			stub,
		})
	}

	/// Session counters, or `None` once the session ended.
	pub fn stats(&self) -> Option<SessionStats> {
		let session = self.session();
		(!session.is_closed()).then(|| session.stats())
	}

	/// Waits until no call is in flight on the session.
	pub async fn drain(&self) {
		self.session().drain().await;
	}
}

impl Disposable for Connection {
	fn dispose(&self) {
		self.stub.dispose();
		let guard = self.guard.lock().take();
		drop(guard);
	}

	fn is_disposed(&self) -> bool {
		self.stub.is_disposed()
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.dispose();
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::Error;
	use crate::target::TargetBuilder;

	fn greeter() -> impl RpcTarget {
		TargetBuilder::new()
			.method("greet", |args, _ctx| async move {
				let name = args.first().and_then(Value::as_str).unwrap_or("nobody");
				Ok(json!(format!("hello {name}")))
			})
			.build()
	}

	#[tokio::test]
	async fn typed_call_helpers_encode_arguments() {
		let conn = Connection::connect_pair(greeter());
		assert_eq!(conn.call1("greet", "ada").await.unwrap(), json!("hello ada"));
		assert_eq!(conn.call0("greet").await.unwrap(), json!("hello nobody"));
	}

	#[tokio::test]
	async fn duplicate_outlives_disposed_original() {
		let conn = Connection::connect_pair(greeter());
		let copy = conn.dup().unwrap();
		conn.dispose();
		assert!(matches!(conn.call0("greet").await, Err(Error::Disposed)));
		assert_eq!(copy.call1("greet", "again").await.unwrap(), json!("hello again"));
		assert!(copy.stats().is_some());

		copy.dispose();
		assert!(copy.stats().is_none());
	}

	#[tokio::test]
	async fn paired_sessions_take_configured_names() {
		let config = SessionConfig::from_toml(r#"name = "calc""#).unwrap();
		let conn = Connection::connect_pair_with(Arc::new(greeter()), &config);
		assert_eq!(conn.session().name(), "calc.client");
		assert_eq!(conn.stats().map(|s| s.imports), Some(1));
		assert!(matches!(conn.session().remote_main(), Ok(_)));
		assert_eq!(conn.stats().map(|s| s.imports), Some(1));
		assert_eq!(conn.call1("greet", "calc").await.unwrap(), json!("hello calc"));
	}

	#[tokio::test]
	async fn borrowed_stub_does_not_close_session() {
		let conn = Connection::connect_pair(greeter());
		let borrowed = Connection::from_stub(conn.stub().dup().unwrap());
		borrowed.dispose();
		assert!(conn.call0("greet").await.is_ok());
	}
}
