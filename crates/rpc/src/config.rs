//! Session configuration.

use serde::{Deserialize, Serialize};

use crate::Result;

/// Settings for one [`RpcSession`](crate::RpcSession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
	/// Name attached to the session's log events.
	pub name: String,
	/// Upper bound on incoming calls whose handlers run at the same time.
	pub max_concurrent_calls: usize,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			name: "session".to_string(),
			max_concurrent_calls: 64,
		}
	}
}

impl SessionConfig {
	/// Parses a TOML document. Missing keys keep their defaults.
	///
	/// # Errors
	///
	/// Returns [`Error::Config`](crate::Error::Config) for malformed input.
	pub fn from_toml(src: &str) -> Result<Self> {
		Ok(toml::from_str(src)?)
	}

	/// Copy of this config under another name.
	#[must_use]
	pub fn named(&self, name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..self.clone()
		}
	}
}
