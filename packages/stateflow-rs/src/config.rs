use std::env;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Default number of idle instances each action pool keeps.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

/// Default pending-queue depth above which the dispatcher logs a warning.
pub const DEFAULT_QUEUE_WARN_DEPTH: usize = 1024;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Maximum idle instances retained per action type. Returns beyond this
    /// are dropped.
    pub pool_capacity: usize,
    /// Pending-queue depth that triggers a warning. `0` disables the check.
    pub queue_warn_depth: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            queue_warn_depth: DEFAULT_QUEUE_WARN_DEPTH,
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from environment variables
    ///
    /// Reads `STATEFLOW_POOL_CAPACITY` and `STATEFLOW_QUEUE_WARN_DEPTH`,
    /// falling back to the defaults when unset.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            pool_capacity: parse_var("STATEFLOW_POOL_CAPACITY", DEFAULT_POOL_CAPACITY)?,
            queue_warn_depth: parse_var("STATEFLOW_QUEUE_WARN_DEPTH", DEFAULT_QUEUE_WARN_DEPTH)?,
        })
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_queue_warn_depth(mut self, depth: usize) -> Self {
        self.queue_warn_depth = depth;
        self
    }
}

fn parse_var(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a non-negative integer", name)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.pool_capacity, DEFAULT_POOL_CAPACITY);
        assert_eq!(config.queue_warn_depth, DEFAULT_QUEUE_WARN_DEPTH);
    }

    #[test]
    fn test_setters() {
        let config = DispatcherConfig::default()
            .with_pool_capacity(4)
            .with_queue_warn_depth(0);
        assert_eq!(config.pool_capacity, 4);
        assert_eq!(config.queue_warn_depth, 0);
    }

    #[test]
    fn test_parse_var_falls_back_when_unset() {
        let value = parse_var("STATEFLOW_TEST_SURELY_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        env::set_var("STATEFLOW_TEST_GARBAGE_CAPACITY", "lots");
        let err = parse_var("STATEFLOW_TEST_GARBAGE_CAPACITY", 7).unwrap_err();
        assert!(err.to_string().contains("STATEFLOW_TEST_GARBAGE_CAPACITY"));
        env::remove_var("STATEFLOW_TEST_GARBAGE_CAPACITY");
    }

    #[test]
    fn test_parse_var_reads_value() {
        env::set_var("STATEFLOW_TEST_READ_CAPACITY", " 12 ");
        assert_eq!(parse_var("STATEFLOW_TEST_READ_CAPACITY", 7).unwrap(), 12);
        env::remove_var("STATEFLOW_TEST_READ_CAPACITY");
    }
}
