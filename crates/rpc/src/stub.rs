//! References to remote capabilities.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::Result;
use crate::error::Error;
use crate::session::RpcSession;
use crate::target::{CALLBACK_METHOD, Disposable};

/// A live reference to one of the peer's exports.
///
/// Every stub owns one reference. [`Stub::dup`] takes another, so the two handles are
/// disposed independently; the peer's export is released once the last one is gone. Dropping
/// a stub disposes it.
pub struct Stub {
	session: RpcSession,
	import: u64,
	disposed: AtomicBool,
}

impl Stub {
	/// Wraps a reference already counted in the session's import table.
	pub(crate) fn adopt(session: RpcSession, import: u64) -> Self {
		Self {
			session,
			import,
			disposed: AtomicBool::new(false),
		}
	}

	/// Calls `method` on the remote capability.
	///
	/// # Errors
	///
	/// - [`Error::Disposed`] after this handle was disposed.
	/// - [`Error::SessionClosed`] if the session ends before the call returns.
	/// - [`Error::Remote`] with the peer handler's failure.
	pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
		if self.is_disposed() {
			return Err(Error::Disposed);
		}
		self.session.call(self.import, method, args).await
	}

	/// Calls a callback capability (see [`from_fn`](crate::target::from_fn)).
	///
	/// # Errors
	///
	/// As [`Stub::call`].
	pub async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
		self.call(CALLBACK_METHOD, args).await
	}

	/// Takes an independent reference to the same capability.
	///
	/// # Errors
	///
	/// [`Error::Disposed`] after this handle was disposed, [`Error::SessionClosed`] once the
	/// session ended.
	pub fn dup(&self) -> Result<Stub> {
		if self.is_disposed() {
			return Err(Error::Disposed);
		}
		self.session.retain_import(self.import)?;
		Ok(Self::adopt(self.session.clone(), self.import))
	}

	/// The session this stub calls through.
	pub fn session(&self) -> &RpcSession {
		&self.session
	}

	/// The peer's export id this stub refers to.
	pub fn import_id(&self) -> u64 {
		self.import
	}
}

impl Disposable for Stub {
	fn dispose(&self) {
		if !self.disposed.swap(true, Ordering::AcqRel) {
			self.session.release_import(self.import);
		}
	}

	fn is_disposed(&self) -> bool {
		self.disposed.load(Ordering::Acquire)
	}
}

impl Drop for Stub {
	fn drop(&mut self) {
		self.dispose();
	}
}

impl fmt::Debug for Stub {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Stub")
			.field("session", &self.session.name())
			.field("import", &self.import)
			.field("disposed", &self.is_disposed())
			.finish()
	}
}
