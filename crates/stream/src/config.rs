//! Stream tuning knobs.

use serde::{Deserialize, Serialize};

/// Buffer sizes used by pipes and batch readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
	/// Items a [`pipe`](crate::pipe) buffers before writers wait.
	pub pipe_capacity: usize,
	/// Batch size used by [`BatchReader::next_batch`](crate::BatchReader::next_batch).
	pub batch_size: usize,
}

impl Default for StreamConfig {
	fn default() -> Self {
		Self {
			pipe_capacity: 16,
			batch_size: 64,
		}
	}
}

impl StreamConfig {
	/// Parses a TOML document. Missing keys keep their defaults.
	///
	/// # Errors
	///
	/// Returns the TOML error for malformed input or mistyped values.
	pub fn from_toml(src: &str) -> Result<Self, toml::de::Error> {
		toml::from_str(src)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_keys_keep_defaults() {
		let config = StreamConfig::from_toml("batch_size = 8").unwrap();
		assert_eq!(
			config,
			StreamConfig {
				pipe_capacity: 16,
				batch_size: 8
			}
		);
		assert_eq!(StreamConfig::from_toml("").unwrap(), StreamConfig::default());
	}

	#[test]
	fn mistyped_value_is_rejected() {
		assert!(StreamConfig::from_toml("pipe_capacity = \"lots\"").is_err());
	}
}
