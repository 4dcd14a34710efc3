//! Uniform failure representation and the stream error taxonomy.
//!
//! Upstream components report typed failures as tagged [`ErrorVariant`]s. [`normalize`]
//! folds them into a [`NormalizedError`] carrying the tag, a readable message, and the
//! original variant for callers that want structured handling instead of message parsing.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};

/// Tag under which an already-normalized error travels.
pub const EXCEPTION_KIND: &str = "exception";

/// A tagged failure as reported by an upstream component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorVariant<P> {
	/// Error tag, e.g. `"timeout"` or `"exception"`.
	pub kind: String,
	/// Structured payload attached to the tag.
	pub payload: P,
}

impl<P> ErrorVariant<P> {
	/// Creates a variant from a tag and its payload.
	pub fn new(kind: impl Into<String>, payload: P) -> Self {
		Self {
			kind: kind.into(),
			payload,
		}
	}
}

/// Uniform failure object: a kind tag, a human-readable message, and the original variant.
#[derive(Clone, thiserror::Error)]
#[error("{message}")]
pub struct NormalizedError {
	kind: String,
	message: String,
	original: Option<Arc<dyn Any + Send + Sync>>,
}

impl NormalizedError {
	/// Creates an error with no attached variant.
	pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			message: message.into(),
			original: None,
		}
	}

	/// Wraps an arbitrary error as an `exception`.
	pub fn exception(err: &(dyn std::error::Error + 'static)) -> Self {
		Self::new(EXCEPTION_KIND, err.to_string())
	}

	/// The kind tag.
	pub fn kind(&self) -> &str {
		&self.kind
	}

	/// The human-readable message.
	pub fn message(&self) -> &str {
		&self.message
	}

	/// Returns the variant this error was normalized from, if it carried payload type `P`.
	pub fn original<P: 'static>(&self) -> Option<&ErrorVariant<P>> {
		self.original.as_deref()?.downcast_ref::<ErrorVariant<P>>()
	}
}

impl fmt::Debug for NormalizedError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("NormalizedError")
			.field("kind", &self.kind)
			.field("message", &self.message)
			.field("has_original", &self.original.is_some())
			.finish()
	}
}

impl PartialEq for NormalizedError {
	fn eq(&self, other: &Self) -> bool {
		self.kind == other.kind && self.message == other.message
	}
}

impl Eq for NormalizedError {}

impl Serialize for NormalizedError {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		use serde::ser::SerializeStruct;
		let mut s = serializer.serialize_struct("NormalizedError", 2)?;
		s.serialize_field("kind", &self.kind)?;
		s.serialize_field("message", &self.message)?;
		s.end()
	}
}

/// Converts a tagged variant into a [`NormalizedError`].
///
/// An `exception` variant whose payload is already a [`NormalizedError`] is passed through
/// unchanged. Otherwise the message embeds the tag and a JSON rendering of the payload,
/// falling back to the tag alone when the payload cannot be serialized.
pub fn normalize<P>(variant: ErrorVariant<P>) -> NormalizedError
where
	P: Serialize + Send + Sync + 'static,
{
	if variant.kind == EXCEPTION_KIND
		&& let Some(err) = (&variant.payload as &dyn Any).downcast_ref::<NormalizedError>()
	{
		return err.clone();
	}

	let message = match serde_json::to_string(&variant.payload) {
		Ok(json) => format!("Stream error [{}]: {json}", variant.kind),
		Err(err) => {
			tracing::trace!(kind = %variant.kind, error = %err, "stream.normalize.payload_unserializable");
			format!("Stream error [{}]", variant.kind)
		}
	};
	NormalizedError {
		kind: variant.kind.clone(),
		message,
		original: Some(Arc::new(variant)),
	}
}

/// A convenient type alias for `Result` with `E` = [`StreamError`].
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Failures surfaced by sources, sinks, and the adapters around them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum StreamError {
	/// The underlying pull primitive failed.
	#[error("source failed: {0}")]
	Source(NormalizedError),
	/// A write, close, or readiness wait failed.
	#[error("sink failed: {0}")]
	Sink(NormalizedError),
	/// A handle was used concurrently against its contract.
	#[error("usage violation: {0}")]
	Usage(&'static str),
	/// The other side cancelled the stream.
	#[error("stream cancelled")]
	Cancelled,
	/// The stream was already closed.
	#[error("stream closed")]
	Closed,
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use serde_json::json;

	use super::*;

	#[test]
	fn exception_payload_passes_through() {
		let inner = NormalizedError::new("timeout", "took too long");
		let out = normalize(ErrorVariant::new(EXCEPTION_KIND, inner.clone()));
		assert_eq!(out, inner);
		// No double wrapping: the passed-through error carries no variant of its own.
		assert!(out.original::<NormalizedError>().is_none());
	}

	#[test]
	fn non_exception_tag_embeds_payload() {
		let out = normalize(ErrorVariant::new("http", json!({"status": 503})));
		assert_eq!(out.kind(), "http");
		assert_eq!(out.message(), r#"Stream error [http]: {"status":503}"#);

		let original = out.original::<serde_json::Value>().expect("variant retained");
		assert_eq!(original.payload["status"], 503);
	}

	#[test]
	fn normalized_payload_under_other_tag_is_wrapped() {
		let inner = NormalizedError::new("io", "broken pipe");
		let out = normalize(ErrorVariant::new("wrapped", inner));
		assert_eq!(out.kind(), "wrapped");
		assert_eq!(out.message(), r#"Stream error [wrapped]: {"kind":"io","message":"broken pipe"}"#);
	}

	#[test]
	fn unserializable_payload_falls_back_to_tag() {
		let mut payload = HashMap::new();
		payload.insert((1u8, 2u8), "tuple keys are not valid JSON object keys");
		let out = normalize(ErrorVariant::new("weird", payload));
		assert_eq!(out.message(), "Stream error [weird]");
		assert!(out.original::<HashMap<(u8, u8), &'static str>>().is_some());
	}

	#[test]
	fn original_with_wrong_type_is_none() {
		let out = normalize(ErrorVariant::new("n", 7u32));
		assert!(out.original::<String>().is_none());
		assert_eq!(out.original::<u32>().map(|v| v.payload), Some(7));
	}
}
