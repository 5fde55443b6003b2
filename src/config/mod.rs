use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// AI attempts per job before the offline fallback runs.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Job attempts allowed in flight at once.
    #[serde(default = "default_concurrent_limit")]
    pub concurrent_limit: usize,

    /// Initial AI call timeout in seconds.
    #[serde(default = "default_ai_timeout_secs")]
    pub ai_timeout_secs: u64,

    /// One-time timeout extension in seconds ("continue waiting" choice).
    #[serde(default = "default_ai_timeout_secs")]
    pub ai_timeout_extension_secs: u64,

    /// Key the queue snapshot is stored under.
    #[serde(default = "default_snapshot_key")]
    pub snapshot_key: String,
}

fn default_max_retries() -> u32 {
    crate::models::job::MAX_RETRIES
}

fn default_concurrent_limit() -> usize {
    2
}

fn default_ai_timeout_secs() -> u64 {
    30
}

fn default_snapshot_key() -> String {
    "receipt_queue".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            concurrent_limit: default_concurrent_limit(),
            ai_timeout_secs: default_ai_timeout_secs(),
            ai_timeout_extension_secs: default_ai_timeout_secs(),
            snapshot_key: default_snapshot_key(),
        }
    }
}

impl QueueConfig {
    /// Load from `RECEIPT_QUEUE_*` environment variables, falling back to
    /// the built-in defaults for anything unset.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::prefixed("RECEIPT_QUEUE_").from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = QueueConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.concurrent_limit, 2);
        assert_eq!(config.ai_timeout_secs, 30);
        assert_eq!(config.ai_timeout_extension_secs, 30);
    }
}
