use std::path::Path;

use serde::{Deserialize, Serialize};

/// Process-wide limits consulted by data pipes and message pipes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Configuration {
    /// Largest message payload accepted by `MessagePipe::write_message`.
    pub max_message_num_bytes: usize,
    /// Most handles that may ride along with one message.
    pub max_message_num_handles: usize,
    /// Capacity used when a data pipe is created with capacity 0.
    pub default_data_pipe_capacity_bytes: usize,
    /// Upper bound on any data pipe capacity.
    pub max_data_pipe_capacity_bytes: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_message_num_bytes: 4 * 1024 * 1024,
            max_message_num_handles: 10_000,
            default_data_pipe_capacity_bytes: 1024 * 1024,
            max_data_pipe_capacity_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Configuration {
    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Read and parse a JSON file.
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw).map_err(std::io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Configuration::from_json(r#"{"max_message_num_bytes": 64}"#).unwrap();
        assert_eq!(config.max_message_num_bytes, 64);
        assert_eq!(config.max_message_num_handles, 10_000);
        assert_eq!(config.default_data_pipe_capacity_bytes, 1024 * 1024);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Configuration::from_json(r#"{"max_bytes": 1}"#).is_err());
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("fp-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"max_data_pipe_capacity_bytes": 4096}"#).unwrap();
        let config = Configuration::load(&path).unwrap();
        assert_eq!(config.max_data_pipe_capacity_bytes, 4096);
        let _ = std::fs::remove_file(&path);
    }
}
