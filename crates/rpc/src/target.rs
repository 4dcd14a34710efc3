//! Locally served capabilities.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tether_stream::NormalizedError;

use crate::session::CallContext;

/// Method name used by [`from_fn`] targets and [`Stub::invoke`](crate::Stub::invoke).
pub const CALLBACK_METHOD: &str = "call";

/// Error kind for calls to a method the target does not have.
pub const METHOD_NOT_FOUND: &str = "method_not_found";

/// Error kind for calls to a target that was already disposed.
pub const DISPOSED: &str = "disposed";

/// Boxed handler future.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, NormalizedError>> + Send>>;

/// An object whose methods a session exposes to its peer.
#[async_trait]
pub trait RpcTarget: Send + Sync + 'static {
	/// Handles one call.
	async fn call(&self, method: &str, args: Vec<Value>, ctx: CallContext) -> Result<Value, NormalizedError>;

	/// Called once when the peer released its last reference, or when the session ends.
	fn on_dispose(&self) {}
}

/// Something that can be released exactly once.
pub trait Disposable {
	/// Releases the resource. Later calls do nothing.
	fn dispose(&self);

	/// True once disposed.
	fn is_disposed(&self) -> bool;
}

type Handler = Arc<dyn Fn(Vec<Value>, CallContext) -> HandlerFuture + Send + Sync>;

/// Builds a target from named handlers.
#[derive(Default)]
pub struct TargetBuilder {
	methods: HashMap<String, Handler>,
}

impl TargetBuilder {
	/// Starts an empty method table.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers `handler` under `name`, replacing any previous handler of that name.
	#[must_use]
	pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
	where
		F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Value, NormalizedError>> + Send + 'static,
	{
		let handler: Handler = Arc::new(move |args, ctx| Box::pin(handler(args, ctx)));
		self.methods.insert(name.into(), handler);
		self
	}

	/// Finishes the table.
	pub fn build(self) -> MethodTable {
		MethodTable {
			methods: self.methods,
		}
	}

	/// Finishes the table with a hook run once when the target is disposed.
	pub fn build_disposable(self, on_dispose: impl FnOnce() + Send + 'static) -> DisposableTarget<MethodTable> {
		DisposableTarget::new(self.build(), on_dispose)
	}
}

/// Target dispatching calls by method name.
pub struct MethodTable {
	methods: HashMap<String, Handler>,
}

impl MethodTable {
	/// Registered method names, unordered.
	pub fn methods(&self) -> impl Iterator<Item = &str> {
		self.methods.keys().map(String::as_str)
	}
}

impl fmt::Debug for MethodTable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MethodTable")
			.field("methods", &self.methods.keys().collect::<Vec<_>>())
			.finish()
	}
}

#[async_trait]
impl RpcTarget for MethodTable {
	async fn call(&self, method: &str, args: Vec<Value>, ctx: CallContext) -> Result<Value, NormalizedError> {
		let Some(handler) = self.methods.get(method) else {
			return Err(NormalizedError::new(METHOD_NOT_FOUND, format!("no method named {method:?}")));
		};
		handler(args, ctx).await
	}
}

/// Target answering [`CALLBACK_METHOD`] with `f`, the shape of a passed-in callback.
pub fn from_fn<F, Fut>(f: F) -> MethodTable
where
	F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = Result<Value, NormalizedError>> + Send + 'static,
{
	TargetBuilder::new()
		.method(CALLBACK_METHOD, move |args, _ctx| f(args))
		.build()
}

type Hook = Box<dyn FnOnce() + Send>;

/// Wraps a target with a one-shot disposal hook.
///
/// Disposal runs the inner target's [`RpcTarget::on_dispose`] and then the hook, once, however
/// many times it is requested. Calls after disposal fail with kind [`DISPOSED`].
pub struct DisposableTarget<T> {
	inner: T,
	hook: Mutex<Option<Hook>>,
	disposed: AtomicBool,
}

impl<T: RpcTarget> DisposableTarget<T> {
	/// Wraps `inner`.
	pub fn new(inner: T, on_dispose: impl FnOnce() + Send + 'static) -> Self {
		Self {
			inner,
			hook: Mutex::new(Some(Box::new(on_dispose))),
			disposed: AtomicBool::new(false),
		}
	}

	/// The wrapped target.
	pub fn inner(&self) -> &T {
		&self.inner
	}
}

impl<T: RpcTarget> Disposable for DisposableTarget<T> {
	fn dispose(&self) {
		if self.disposed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.inner.on_dispose();
		let hook = self.hook.lock().take();
		if let Some(hook) = hook {
			hook();
		}
	}

	fn is_disposed(&self) -> bool {
		self.disposed.load(Ordering::Acquire)
	}
}

#[async_trait]
impl<T: RpcTarget> RpcTarget for DisposableTarget<T> {
	async fn call(&self, method: &str, args: Vec<Value>, ctx: CallContext) -> Result<Value, NormalizedError> {
		if self.is_disposed() {
			return Err(NormalizedError::new(DISPOSED, "target was disposed"));
		}
		self.inner.call(method, args, ctx).await
	}

	fn on_dispose(&self) {
		self.dispose();
	}
}

impl<T> fmt::Debug for DisposableTarget<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DisposableTarget")
			.field("disposed", &self.disposed.load(Ordering::Acquire))
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use serde_json::json;

	use super::*;

	fn calculator() -> TargetBuilder {
		TargetBuilder::new().method("add", |args, _ctx| async move {
			let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
			Ok(json!(sum))
		})
	}

	#[tokio::test]
	async fn method_table_dispatches_by_name() {
		let target = calculator().build();
		let out = target.call("add", vec![json!(2), json!(3)], CallContext::default()).await;
		assert_eq!(out, Ok(json!(5)));

		let err = target.call("sub", vec![], CallContext::default()).await.unwrap_err();
		assert_eq!(err.kind(), METHOD_NOT_FOUND);
		assert_eq!(target.methods().collect::<Vec<_>>(), vec!["add"]);
	}

	#[tokio::test]
	async fn from_fn_answers_callback_method() {
		let target = from_fn(|args| async move { Ok(json!(args.len())) });
		let out = target.call(CALLBACK_METHOD, vec![json!(1), json!(2)], CallContext::default()).await;
		assert_eq!(out, Ok(json!(2)));
	}

	#[tokio::test]
	async fn disposal_hook_runs_once_and_blocks_calls() {
		let hits = Arc::new(AtomicUsize::new(0));
		let target = calculator().build_disposable({
			let hits = Arc::clone(&hits);
			move || {
				hits.fetch_add(1, Ordering::SeqCst);
			}
		});
		assert!(!target.is_disposed());
		target.on_dispose();
		target.dispose();
		assert!(target.is_disposed());
		assert_eq!(hits.load(Ordering::SeqCst), 1);

		let err = target.call("add", vec![], CallContext::default()).await.unwrap_err();
		assert_eq!(err.kind(), DISPOSED);
	}
}
