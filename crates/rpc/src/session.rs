//! Capability RPC session engine.
//!
//! A session runs two tasks over one [`RpcTransport`]: a reader that decodes incoming frames
//! and dispatches them, and a writer that drains the outbound frame queue in order. Each side
//! keeps an export table (capabilities it serves, with the number of references the peer
//! holds) and an import table (references it holds to the peer's exports). A reference is
//! released with a `release` frame once the last local stub for it is disposed; the
//! export's [`RpcTarget::on_dispose`] fires when its count reaches zero or the session ends.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use parking_lot::Mutex;
use pin_project_lite::pin_project;
use serde::Serialize;
use serde_json::Value;
use tether_stream::NormalizedError;
use tokio::sync::{Notify, Semaphore, mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::protocol::{Frame, IdSeq, MAIN_ID, outcome, stub_marker};
use crate::stub::Stub;
use crate::target::RpcTarget;
use crate::transport::RpcTransport;

/// Error kind for calls naming an export the session does not have.
pub const NO_SUCH_TARGET: &str = "no_such_target";

/// Error kind for handlers that panicked.
pub const HANDLER_PANICKED: &str = "panic";

/// Counters describing a session's capability tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
	/// Peer exports this side holds references to.
	pub imports: usize,
	/// Local capabilities the peer may call.
	pub exports: usize,
	/// Outgoing calls awaiting their return.
	pub pending_calls: usize,
}

/// Per-call context handed to [`RpcTarget::call`].
///
/// Capability references found among the call's arguments are imported before the handler
/// runs and held by the context, so they are released when the context drops unless the
/// handler keeps a [`Stub`] of its own.
#[derive(Debug, Default)]
pub struct CallContext {
	stubs: Vec<Stub>,
}

impl CallContext {
	/// Stubs for the capability arguments, in argument order.
	pub fn stubs(&self) -> &[Stub] {
		&self.stubs
	}

	/// A new reference to the capability that `arg` refers to.
	///
	/// # Errors
	///
	/// [`Error::NotACapability`] if `arg` is not a capability reference of this call, otherwise
	/// the errors of [`Stub::dup`].
	pub fn stub(&self, arg: &Value) -> Result<Stub> {
		let id = stub_marker(arg).ok_or(Error::NotACapability)?;
		self.stubs
			.iter()
			.find(|stub| stub.import_id() == id)
			.ok_or(Error::NotACapability)?
			.dup()
	}
}

struct Export {
	target: Arc<dyn RpcTarget>,
	/// References the peer holds.
	refs: u32,
}

struct Import {
	/// Live local stubs.
	local: u32,
	/// Times the peer introduced this export to us, returned in full on release.
	received: u32,
}

struct SessionState {
	/// `None` once the session shut down.
	outbound: Option<mpsc::UnboundedSender<Frame>>,
	exports: HashMap<u64, Export>,
	export_ids: IdSeq,
	imports: HashMap<u64, Import>,
	pending: HashMap<u64, oneshot::Sender<Result<Value, NormalizedError>>>,
	call_ids: IdSeq,
	/// Incoming calls whose handlers have not returned yet.
	running: usize,
	main_claimed: bool,
}

impl SessionState {
	fn send(&self, frame: Frame) -> bool {
		self.outbound.as_ref().is_some_and(|tx| tx.send(frame).is_ok())
	}
}

struct SessionInner {
	name: String,
	state: Mutex<SessionState>,
	idle: Notify,
	permits: Arc<Semaphore>,
	transport: Arc<dyn RpcTransport>,
}

/// One side of an RPC conversation. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct RpcSession {
	inner: Arc<SessionInner>,
}

/// Runs a session serving `main` to the peer on the other end of `transport`.
///
/// # Panics
///
/// Panics when called outside a tokio runtime.
pub fn serve(transport: impl RpcTransport, main: Arc<dyn RpcTarget>, config: &SessionConfig) -> RpcSession {
	RpcSession::new(transport, Some(main), config)
}

impl RpcSession {
	/// Starts a session over `transport`, optionally serving `main` as export 0.
	///
	/// # Panics
	///
	/// Panics when called outside a tokio runtime.
	pub fn new(transport: impl RpcTransport, main: Option<Arc<dyn RpcTarget>>, config: &SessionConfig) -> Self {
		let transport: Arc<dyn RpcTransport> = Arc::new(transport);
		let (tx, rx) = mpsc::unbounded_channel();
		let serving = main.is_some();
		let mut exports = HashMap::new();
		if let Some(target) = main {
			exports.insert(MAIN_ID, Export { target, refs: 1 });
		}
		let inner = Arc::new(SessionInner {
			name: config.name.clone(),
			state: Mutex::new(SessionState {
				outbound: Some(tx),
				exports,
				export_ids: IdSeq::starting_at(MAIN_ID + 1),
				imports: HashMap::new(),
				pending: HashMap::new(),
				call_ids: IdSeq::default(),
				running: 0,
				main_claimed: false,
			}),
			idle: Notify::new(),
			permits: Arc::new(Semaphore::new(config.max_concurrent_calls.max(1))),
			transport: Arc::clone(&transport),
		});

		tokio::spawn(write_loop(inner.name.clone(), transport, rx));
		tokio::spawn(read_loop(Arc::clone(&inner)));
		debug!(session = %inner.name, serving, "rpc.session.started");
		Self { inner }
	}

	/// Name from the session's config.
	pub fn name(&self) -> &str {
		&self.inner.name
	}

	/// True once the session shut down.
	pub fn is_closed(&self) -> bool {
		self.inner.state.lock().outbound.is_none()
	}

	/// A stub for the peer's main capability.
	///
	/// # Errors
	///
	/// [`Error::SessionClosed`] once the session ended, [`Error::Disposed`] if every earlier
	/// main stub was already disposed and the reference released.
	pub fn remote_main(&self) -> Result<Stub> {
		let mut guard = self.inner.state.lock();
		let state = &mut *guard;
		if state.outbound.is_none() {
			return Err(Error::SessionClosed);
		}
		match state.imports.get_mut(&MAIN_ID) {
			Some(import) => import.local += 1,
			None if !state.main_claimed => {
				state.imports.insert(MAIN_ID, Import { local: 1, received: 1 });
			}
			None => return Err(Error::Disposed),
		}
		state.main_claimed = true;
		drop(guard);
		Ok(Stub::adopt(self.clone(), MAIN_ID))
	}

	/// Takes a main reference without the checks of [`RpcSession::remote_main`], for a
	/// session that was just created.
	pub(crate) fn claim_main(&self) -> Stub {
		let mut guard = self.inner.state.lock();
		let state = &mut *guard;
		state
			.imports
			.entry(MAIN_ID)
			.or_insert(Import { local: 0, received: 1 })
			.local += 1;
		state.main_claimed = true;
		drop(guard);
		Stub::adopt(self.clone(), MAIN_ID)
	}

	/// Exports `target` so it can be passed to the peer as a call argument.
	///
	/// Returns the export id; [`stub_ref`](crate::protocol::stub_ref) turns it into the
	/// argument value. The export counts one reference, handed to the peer with the call.
	///
	/// # Errors
	///
	/// [`Error::SessionClosed`] once the session ended.
	pub fn export(&self, target: Arc<dyn RpcTarget>) -> Result<u64> {
		let mut state = self.inner.state.lock();
		if state.outbound.is_none() {
			return Err(Error::SessionClosed);
		}
		let id = state.export_ids.take();
		state.exports.insert(id, Export { target, refs: 1 });
		trace!(session = %self.inner.name, id, "rpc.session.exported");
		Ok(id)
	}

	/// Snapshot of the capability tables.
	pub fn stats(&self) -> SessionStats {
		let state = self.inner.state.lock();
		SessionStats {
			imports: state.imports.len(),
			exports: state.exports.len(),
			pending_calls: state.pending.len(),
		}
	}

	/// Resolves once no outgoing call awaits its return and no incoming call is being handled.
	pub async fn drain(&self) {
		loop {
			// Register before checking to avoid a lost wakeup.
			let notified = self.inner.idle.notified();
			{
				let state = self.inner.state.lock();
				if state.pending.is_empty() && state.running == 0 {
					return;
				}
			}
			notified.await;
		}
	}

	/// Shuts the session down. Idempotent.
	///
	/// Pending outgoing calls fail with [`Error::SessionClosed`], every export is disposed,
	/// and the transport closes once frames already queued have been written.
	pub fn close(&self) {
		self.inner.shutdown();
	}

	pub(crate) async fn call(&self, target: u64, method: &str, args: Vec<Value>) -> Result<Value> {
		let rx = {
			let mut guard = self.inner.state.lock();
			let state = &mut *guard;
			let id = state.call_ids.take();
			let frame = Frame::Call {
				id,
				target,
				method: method.to_string(),
				args,
			};
			if !state.send(frame) {
				return Err(Error::SessionClosed);
			}
			let (tx, rx) = oneshot::channel();
			state.pending.insert(id, tx);
			trace!(session = %self.inner.name, id, target, method, "rpc.session.call");
			rx
		};
		match rx.await {
			Ok(Ok(value)) => Ok(value),
			Ok(Err(err)) => Err(Error::Remote(err)),
			Err(_) => Err(Error::SessionClosed),
		}
	}

	/// Counts another local stub for `import`.
	pub(crate) fn retain_import(&self, import: u64) -> Result<()> {
		let mut state = self.inner.state.lock();
		if state.outbound.is_none() {
			return Err(Error::SessionClosed);
		}
		let entry = state.imports.get_mut(&import).ok_or(Error::Disposed)?;
		entry.local += 1;
		Ok(())
	}

	/// Drops one local stub for `import`, releasing it to the peer after the last one.
	pub(crate) fn release_import(&self, import: u64) {
		let mut guard = self.inner.state.lock();
		let state = &mut *guard;
		let Some(entry) = state.imports.get_mut(&import) else {
			return;
		};
		entry.local = entry.local.saturating_sub(1);
		if entry.local > 0 {
			return;
		}
		let count = entry.received;
		state.imports.remove(&import);
		state.send(Frame::Release { target: import, count });
		trace!(session = %self.inner.name, import, count, "rpc.session.released");
	}
}

impl fmt::Debug for RpcSession {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RpcSession")
			.field("name", &self.inner.name)
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl SessionInner {
	fn handle(self: &Arc<Self>, frame: Frame) {
		match frame {
			Frame::Call {
				id,
				target,
				method,
				args,
			} => self.handle_call(id, target, method, args),
			Frame::Return { id, result, error } => {
				let waiter = self.state.lock().pending.remove(&id);
				match waiter {
					Some(tx) => {
						// The caller may have stopped waiting.
						let _ = tx.send(outcome(result, error));
					}
					None => debug!(session = %self.name, id, "rpc.session.unmatched_return"),
				}
				self.idle.notify_waiters();
			}
			Frame::Release { target, count } => {
				let released = {
					let mut guard = self.state.lock();
					let state = &mut *guard;
					let last = state.exports.get_mut(&target).is_some_and(|export| {
						export.refs = export.refs.saturating_sub(count);
						export.refs == 0
					});
					if last { state.exports.remove(&target) } else { None }
				};
				if let Some(export) = released {
					debug!(session = %self.name, target, "rpc.session.export_disposed");
					export.target.on_dispose();
				}
			}
		}
	}

	fn handle_call(self: &Arc<Self>, id: u64, target: u64, method: String, args: Vec<Value>) {
		let session = RpcSession { inner: Arc::clone(self) };
		let (export, capabilities) = {
			let mut guard = self.state.lock();
			let state = &mut *guard;
			let export = state.exports.get(&target).map(|e| Arc::clone(&e.target));
			let capabilities: Vec<u64> = args.iter().filter_map(stub_marker).collect();
			for &cap in &capabilities {
				let entry = state.imports.entry(cap).or_insert(Import { local: 0, received: 0 });
				entry.local += 1;
				entry.received += 1;
			}
			state.running += 1;
			(export, capabilities)
		};
		let ctx = CallContext {
			stubs: capabilities
				.into_iter()
				.map(|cap| Stub::adopt(session.clone(), cap))
				.collect(),
		};
		debug!(session = %self.name, id, target, method = %method, "rpc.session.call_received");

		let inner = Arc::clone(self);
		tokio::spawn(async move {
			let frame = match export {
				None => {
					drop(ctx);
					Frame::returned(
						id,
						Err(NormalizedError::new(NO_SUCH_TARGET, format!("no export with id {target}"))),
					)
				}
				Some(export) => {
					let _permit = Arc::clone(&inner.permits).acquire_owned().await;
					let handler = ReturnFuture {
						fut: async move { export.call(&method, args, ctx).await },
						id,
					};
					match tokio::spawn(handler).await {
						Ok(frame) => frame,
						Err(err) => {
							error!(session = %inner.name, id, error = %err, "rpc.session.handler_panicked");
							Frame::returned(id, Err(NormalizedError::new(HANDLER_PANICKED, err.to_string())))
						}
					}
				}
			};
			if !inner.state.lock().send(frame) {
				debug!(session = %inner.name, id, "rpc.session.return_dropped");
			}
			inner.finish_handler();
		});
	}

	fn finish_handler(&self) {
		{
			let mut state = self.state.lock();
			state.running = state.running.saturating_sub(1);
		}
		self.idle.notify_waiters();
	}

	fn shutdown(&self) {
		let (pending, exports) = {
			let mut state = self.state.lock();
			if state.outbound.take().is_none() {
				return;
			}
			state.imports.clear();
			(std::mem::take(&mut state.pending), std::mem::take(&mut state.exports))
		};
		let failed = pending.len();
		drop(pending);
		for export in exports.into_values() {
			export.target.on_dispose();
		}
		self.idle.notify_waiters();
		debug!(session = %self.name, failed, "rpc.session.closed");
	}
}

async fn read_loop(inner: Arc<SessionInner>) {
	loop {
		match inner.transport.receive().await {
			Ok(Some(text)) => match Frame::decode(&text) {
				Ok(frame) => inner.handle(frame),
				Err(err) => warn!(session = %inner.name, error = %err, "rpc.session.bad_frame"),
			},
			Ok(None) => break,
			Err(err) => {
				warn!(session = %inner.name, error = %err, "rpc.session.receive_failed");
				break;
			}
		}
	}
	inner.shutdown();
	inner.transport.close();
}

/// Writes queued frames in order, then closes the transport once the queue is closed.
async fn write_loop(name: String, transport: Arc<dyn RpcTransport>, mut rx: mpsc::UnboundedReceiver<Frame>) {
	while let Some(frame) = rx.recv().await {
		let text = match frame.encode() {
			Ok(text) => text,
			Err(err) => {
				error!(session = %name, error = %err, "rpc.session.encode_failed");
				continue;
			}
		};
		if let Err(err) = transport.send(text).await {
			debug!(session = %name, error = %err, "rpc.session.send_failed");
			break;
		}
	}
	transport.close();
}

pin_project! {
	/// Turns a handler outcome into the `return` frame answering call `id`.
	struct ReturnFuture<Fut> {
		#[pin]
		fut: Fut,
		id: u64,
	}
}

impl<Fut> Future for ReturnFuture<Fut>
where
	Fut: Future<Output = Result<Value, NormalizedError>>,
{
	type Output = Frame;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.project();
		let outcome = ready!(this.fut.poll(cx));
		Poll::Ready(Frame::returned(*this.id, outcome))
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use serde_json::json;

	use super::*;
	use crate::duplex::{self, Endpoint};
	use crate::target::{Disposable, METHOD_NOT_FOUND, TargetBuilder};

	fn echo() -> Arc<dyn RpcTarget> {
		Arc::new(
			TargetBuilder::new()
				.method("echo", |args, _ctx| async move { Ok(Value::Array(args)) })
				.method("hang", |_args, _ctx| std::future::pending())
				.method("explode", explode)
				.build(),
		)
	}

	async fn explode(_args: Vec<Value>, _ctx: CallContext) -> Result<Value, NormalizedError> {
		panic!("handler exploded")
	}

	fn linked(main: Arc<dyn RpcTarget>) -> (RpcSession, RpcSession) {
		let (a, b) = duplex::pair::<String>();
		let config = SessionConfig::default();
		let server = serve(a, main, &config.named("server"));
		let client = RpcSession::new(b, None, &config.named("client"));
		(server, client)
	}

	async fn eventually(mut check: impl FnMut() -> bool) {
		tokio::time::timeout(Duration::from_secs(1), async {
			while !check() {
				tokio::time::sleep(Duration::from_millis(1)).await;
			}
		})
		.await
		.expect("condition reached in time");
	}

	#[tokio::test]
	async fn call_round_trip() {
		let (_server, client) = linked(echo());
		let main = client.remote_main().unwrap();
		assert_eq!(main.call("echo", vec![json!(1), json!("a")]).await.unwrap(), json!([1, "a"]));
		assert_eq!(client.stats().pending_calls, 0);
	}

	#[tokio::test]
	async fn unknown_method_and_target_are_remote_errors() {
		let (server, client) = linked(echo());
		let main = client.remote_main().unwrap();
		let Err(Error::Remote(err)) = main.call("missing", vec![]).await else {
			panic!("expected remote error");
		};
		assert_eq!(err.kind(), METHOD_NOT_FOUND);

		// The client serves nothing, so the server's view of its main is empty.
		let back = server.remote_main().unwrap();
		let Err(Error::Remote(err)) = back.call("echo", vec![]).await else {
			panic!("expected remote error");
		};
		assert_eq!(err.kind(), NO_SUCH_TARGET);
	}

	#[tokio::test]
	async fn handler_panic_becomes_error_return() {
		let (_server, client) = linked(echo());
		let main = client.remote_main().unwrap();
		let Err(Error::Remote(err)) = main.call("explode", vec![]).await else {
			panic!("expected remote error");
		};
		assert_eq!(err.kind(), HANDLER_PANICKED);
		assert_eq!(main.call("echo", vec![]).await.unwrap(), json!([]));
	}

	#[tokio::test]
	async fn last_release_disposes_export_once() {
		let hits = Arc::new(AtomicUsize::new(0));
		let main = TargetBuilder::new().build_disposable({
			let hits = Arc::clone(&hits);
			move || {
				hits.fetch_add(1, Ordering::SeqCst);
			}
		});
		let (server, client) = linked(Arc::new(main));
		let first = client.remote_main().unwrap();
		let second = first.dup().unwrap();
		assert_eq!(client.stats().imports, 1);

		first.dispose();
		first.dispose();
		tokio::time::sleep(Duration::from_millis(5)).await;
		assert_eq!(hits.load(Ordering::SeqCst), 0);
		assert_eq!(server.stats().exports, 1);

		drop(second);
		eventually(|| server.stats().exports == 0).await;
		assert_eq!(hits.load(Ordering::SeqCst), 1);
		assert_eq!(client.stats().imports, 0);
		assert!(matches!(client.remote_main(), Err(Error::Disposed)));

		server.close();
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn closing_fails_pending_calls() {
		let (server, client) = linked(echo());
		let main = client.remote_main().unwrap();
		let hanging = tokio::spawn(async move { main.call("hang", vec![]).await });
		eventually(|| client.stats().pending_calls == 1).await;

		server.close();
		assert!(matches!(hanging.await.unwrap(), Err(Error::SessionClosed)));
		eventually(|| client.is_closed()).await;
		assert!(matches!(client.remote_main(), Err(Error::SessionClosed)));
	}

	#[tokio::test]
	async fn drain_waits_for_calls_and_handlers() {
		let (release_tx, release_rx) = oneshot::channel::<()>();
		let release_rx = Arc::new(Mutex::new(Some(release_rx)));
		let main = TargetBuilder::new()
			.method("gate", move |_args, _ctx| {
				let rx = release_rx.lock().take();
				async move {
					if let Some(rx) = rx {
						let _ = rx.await;
					}
					Ok(Value::Null)
				}
			})
			.build();
		let (server, client) = linked(Arc::new(main));
		let main = client.remote_main().unwrap();
		let call = tokio::spawn(async move { main.call("gate", vec![]).await });
		eventually(|| client.stats().pending_calls == 1).await;

		let drained = tokio::time::timeout(Duration::from_millis(10), server.drain()).await;
		assert!(drained.is_err(), "handler still running");
		release_tx.send(()).unwrap();
		tokio::time::timeout(Duration::from_secs(1), client.drain())
			.await
			.expect("client drains");
		tokio::time::timeout(Duration::from_secs(1), server.drain())
			.await
			.expect("server drains");
		assert_eq!(call.await.unwrap().unwrap(), Value::Null);
	}

	#[tokio::test]
	async fn bad_frames_are_skipped() {
		let (a, raw): (Endpoint<String>, Endpoint<String>) = duplex::pair();
		let _server = serve(a, echo(), &SessionConfig::default());
		raw.send("not a frame".into()).unwrap();
		let call = Frame::Call {
			id: 9,
			target: MAIN_ID,
			method: "echo".into(),
			args: vec![json!(true)],
		};
		raw.send(call.encode().unwrap()).unwrap();
		let reply = raw.receive().await.unwrap().unwrap();
		assert_eq!(Frame::decode(&reply).unwrap(), Frame::returned(9, Ok(json!([true]))));
	}
}
