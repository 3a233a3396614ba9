//! Bridge timing and transfer configuration.
//!
//! The printer service and characteristic identifiers are fixed constants
//! (see the crate root); only timings and chunking are tunable.

use std::time::Duration;

/// How long a Bluetooth scan window stays open.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(5);

/// How long a connect attempt may take before it is reported as failed.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Maximum bytes per characteristic write.
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Pause between consecutive chunk writes.
pub const DEFAULT_CHUNK_PACING: Duration = Duration::from_millis(100);

/// Runtime configuration for a [`crate::Bridge`].
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub scan_window: Duration,
    pub connect_timeout: Duration,
    pub chunk_size: usize,
    pub chunk_pacing: Duration,
    /// Write with response and wait for the adapter to confirm every write
    /// of an invocation (one per chunk) before reporting success.
    pub confirm_writes: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            scan_window: DEFAULT_SCAN_WINDOW,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_pacing: DEFAULT_CHUNK_PACING,
            confirm_writes: false,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `BRIDGE_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&get, "BRIDGE_SCAN_WINDOW_MS") {
            config.scan_window = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&get, "BRIDGE_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var::<usize>(&get, "BRIDGE_CHUNK_SIZE").filter(|s| *s > 0) {
            config.chunk_size = size;
        }
        if let Some(ms) = parse_var::<u64>(&get, "BRIDGE_CHUNK_PACING_MS") {
            config.chunk_pacing = Duration::from_millis(ms);
        }
        if let Some(flag) = get("BRIDGE_CONFIRM_WRITES") {
            config.confirm_writes = flag == "true" || flag == "1";
        }

        config
    }

    /// Builder: set the scan window.
    pub fn with_scan_window(mut self, window: Duration) -> Self {
        self.scan_window = window;
        self
    }

    /// Builder: set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder: set the chunk size.
    ///
    /// # Panics
    /// Panics if `size` is zero.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        assert!(size > 0, "Chunk size must be greater than zero");
        self.chunk_size = size;
        self
    }

    /// Builder: set the pause between chunks.
    pub fn with_chunk_pacing(mut self, pacing: Duration) -> Self {
        self.chunk_pacing = pacing;
        self
    }

    /// Builder: wait for write confirmations.
    pub fn with_confirm_writes(mut self, val: bool) -> Self {
        self.confirm_writes = val;
        self
    }
}

fn parse_var<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.scan_window, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.chunk_pacing, Duration::from_millis(100));
        assert!(!config.confirm_writes);
    }

    #[test]
    fn test_builder_chain() {
        let config = BridgeConfig::new()
            .with_scan_window(Duration::from_secs(1))
            .with_connect_timeout(Duration::from_millis(500))
            .with_chunk_size(20)
            .with_chunk_pacing(Duration::ZERO)
            .with_confirm_writes(true);

        assert_eq!(config.scan_window, Duration::from_secs(1));
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.chunk_size, 20);
        assert_eq!(config.chunk_pacing, Duration::ZERO);
        assert!(config.confirm_writes);
    }

    #[test]
    #[should_panic(expected = "Chunk size must be greater than zero")]
    fn test_zero_chunk_size() {
        BridgeConfig::new().with_chunk_size(0);
    }

    #[test]
    fn test_env_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("BRIDGE_SCAN_WINDOW_MS", "2500"),
            ("BRIDGE_CHUNK_SIZE", "180"),
            ("BRIDGE_CONFIRM_WRITES", "true"),
        ]));
        assert_eq!(config.scan_window, Duration::from_millis(2500));
        assert_eq!(config.chunk_size, 180);
        assert!(config.confirm_writes);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn test_invalid_env_values_fall_back() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("BRIDGE_CONNECT_TIMEOUT_MS", "soon"),
            ("BRIDGE_CHUNK_SIZE", "0"),
            ("BRIDGE_CHUNK_PACING_MS", "-5"),
        ]));
        assert_eq!(config, BridgeConfig::default());
    }
}
