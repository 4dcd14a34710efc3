//! Session wire frames and identifiers.
//!
//! Frames travel as JSON text:
//! `{"type":"call","id":0,"target":0,"method":"ping","args":["hi"]}`,
//! `{"type":"return","id":0,"result":"pong: hi"}`,
//! `{"type":"release","target":3,"count":1}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_stream::NormalizedError;

/// Export id of a session's main capability.
pub const MAIN_ID: u64 = 0;

/// Key marking a JSON object as a reference to an exported capability.
pub const STUB_MARKER: &str = "$stub";

/// Monotonic id source for calls, exports and listeners.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdSeq {
	next: u64,
}

impl IdSeq {
	/// Sequence whose first id is `first`.
	#[must_use]
	pub const fn starting_at(first: u64) -> Self {
		Self { next: first }
	}

	/// Hands out the current id and advances.
	pub fn take(&mut self) -> u64 {
		let id = self.next;
		self.next += 1;
		id
	}
}

/// Error as carried by a `return` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
	/// Kind tag of the normalized error.
	pub kind: String,
	/// Human-readable message.
	pub message: String,
}

impl From<&NormalizedError> for WireError {
	fn from(err: &NormalizedError) -> Self {
		Self {
			kind: err.kind().to_string(),
			message: err.message().to_string(),
		}
	}
}

impl From<WireError> for NormalizedError {
	fn from(err: WireError) -> Self {
		NormalizedError::new(err.kind, err.message)
	}
}

/// One session message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
	/// Invoke `method` on the peer's export `target`.
	Call {
		/// Call id, echoed by the matching `return`.
		id: u64,
		/// Export id on the receiving side.
		target: u64,
		/// Method name.
		method: String,
		/// Positional arguments.
		args: Vec<Value>,
	},
	/// Outcome of a call. Exactly one of `result` and `error` is set.
	Return {
		/// Id of the call being answered.
		id: u64,
		/// Successful result.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		result: Option<Value>,
		/// Failure.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		error: Option<WireError>,
	},
	/// Drop `count` references to the receiver's export `target`.
	Release {
		/// Export id on the receiving side.
		target: u64,
		/// Number of references released.
		count: u32,
	},
}

impl Frame {
	/// Builds the `return` frame for a handler outcome.
	pub fn returned(id: u64, outcome: Result<Value, NormalizedError>) -> Self {
		match outcome {
			Ok(value) => Self::Return {
				id,
				result: Some(value),
				error: None,
			},
			Err(err) => Self::Return {
				id,
				result: None,
				error: Some(WireError::from(&err)),
			},
		}
	}

	/// Serializes the frame.
	///
	/// # Errors
	///
	/// Fails if an argument or result cannot be rendered as JSON.
	pub fn encode(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}

	/// Parses a frame.
	///
	/// # Errors
	///
	/// Fails on malformed JSON or an unknown frame type.
	pub fn decode(text: &str) -> serde_json::Result<Self> {
		serde_json::from_str(text)
	}
}

/// Splits a `return` frame's fields into the call outcome.
pub(crate) fn outcome(result: Option<Value>, error: Option<WireError>) -> Result<Value, NormalizedError> {
	match error {
		Some(err) => Err(err.into()),
		None => Ok(result.unwrap_or(Value::Null)),
	}
}

/// Argument value referring to export `id`.
pub fn stub_ref(id: u64) -> Value {
	let mut map = serde_json::Map::new();
	map.insert(STUB_MARKER.to_string(), Value::from(id));
	Value::Object(map)
}

/// Export id named by a capability reference argument, if `value` is one.
pub fn stub_marker(value: &Value) -> Option<u64> {
	let map = value.as_object()?;
	if map.len() != 1 {
		return None;
	}
	map.get(STUB_MARKER)?.as_u64()
}
