//! Configuration management for Tabulite

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for the Tabulite engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Streaming parser configuration
    pub parser: ParserConfig,

    /// Batch store configuration
    pub storage: StorageConfig,

    /// Fuzzy index configuration
    pub fuzzy: FuzzyConfig,

    /// Query engine configuration
    pub query: QueryConfig,

    /// Annotation store configuration
    pub annotations: AnnotationConfig,
}

/// Options recognized by the idempotent `init` request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitOptions {
    /// Read chunk size override, in bytes
    pub chunk_size: Option<usize>,
    /// Enable the count-only group-by fast path
    pub enable_fast_group_engine: Option<bool>,
    /// Verbose engine logging
    pub debug_logging: Option<bool>,
    /// Batches slower than this are logged at warn level
    pub slow_batch_threshold_ms: Option<u64>,
}

impl Config {
    /// Merge `init(options)` into the configuration; unspecified
    /// fields keep their current values
    pub fn apply_init(&mut self, options: &InitOptions) {
        if let Some(chunk_size) = options.chunk_size {
            self.parser.chunk_size = chunk_size.max(1);
        }
        if let Some(fast) = options.enable_fast_group_engine {
            self.query.fast_group_engine = fast;
        }
        if let Some(debug) = options.debug_logging {
            self.query.debug_logging = debug;
        }
        if let Some(threshold) = options.slow_batch_threshold_ms {
            self.query.slow_batch_threshold = Duration::from_millis(threshold);
        }
    }
}

/// Streaming parser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Rows accumulated per column batch before a flush (default: 10 000)
    pub batch_size: usize,

    /// Rows between row-offset checkpoints (default: 50 000)
    pub checkpoint_interval: u32,

    /// Bytes requested per read from the source (default: 1MB)
    pub chunk_size: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            checkpoint_interval: 50_000,
            chunk_size: 1024 * 1024, // 1MB
        }
    }
}

/// Batch store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Decoded batches kept in memory (default: 4)
    pub cache_entries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { cache_entries: 4 }
    }
}

/// Fuzzy index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyConfig {
    /// Tokens retained per column (default: 50 000)
    pub max_tokens_per_column: usize,

    /// Approximate memory budget for the token inventory (default: 32MB)
    pub max_memory_bytes: usize,

    /// Maximum bounded edit distance for suggestions (default: 2)
    pub max_distance: u32,

    /// Tokens taken from a single cell (default: 100)
    pub max_tokens_per_cell: usize,

    /// Suggestions returned per lookup (default: 5)
    pub max_suggestions: usize,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_column: 50_000,
            max_memory_bytes: 32 * 1024 * 1024, // 32MB
            max_distance: 2,
            max_tokens_per_cell: 100,
            max_suggestions: 5,
        }
    }
}

/// Query engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Default page size when a request omits `limit` (default: 100)
    pub default_page_size: usize,

    /// Global search match cap (default: 500)
    pub search_limit: usize,

    /// Needles at most this long fall back to fuzzy matching (default: 10)
    pub fuzzy_search_max_needle: usize,

    /// Regex patterns beyond this length are rejected (default: 512)
    pub max_regex_length: usize,

    /// Count-only group-by fast path
    pub fast_group_engine: bool,

    /// Verbose engine logging
    pub debug_logging: bool,

    /// Batches slower than this are logged at warn level
    #[serde(with = "duration_millis")]
    pub slow_batch_threshold: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            search_limit: 500,
            fuzzy_search_max_needle: 10,
            max_regex_length: 512,
            fast_group_engine: true,
            debug_logging: false,
            slow_batch_threshold: Duration::from_millis(250),
        }
    }
}

/// Annotation store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationConfig {
    /// Autosave debounce after the last dirty mark (default: 30s)
    #[serde(with = "duration_millis")]
    pub autosave_debounce: Duration,

    /// Ceiling from the first unsaved dirty mark (default: 60s)
    #[serde(with = "duration_millis")]
    pub autosave_max_interval: Duration,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            autosave_debounce: Duration::from_secs(30),
            autosave_max_interval: Duration::from_secs(60),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.parser.batch_size, 10_000);
        assert_eq!(config.parser.checkpoint_interval, 50_000);
        assert_eq!(config.storage.cache_entries, 4);
        assert_eq!(config.fuzzy.max_tokens_per_column, 50_000);
        assert_eq!(config.fuzzy.max_distance, 2);
        assert_eq!(config.query.search_limit, 500);
        assert_eq!(config.annotations.autosave_debounce, Duration::from_secs(30));
    }

    #[test]
    fn test_apply_init_is_partial() {
        let mut config = Config::default();
        config.apply_init(&InitOptions {
            chunk_size: Some(4096),
            slow_batch_threshold_ms: Some(1000),
            ..InitOptions::default()
        });
        assert_eq!(config.parser.chunk_size, 4096);
        assert_eq!(config.query.slow_batch_threshold, Duration::from_millis(1000));
        // untouched fields keep their defaults
        assert!(config.query.fast_group_engine);
    }

    #[test]
    fn test_config_round_trips_as_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.parser.batch_size, config.parser.batch_size);
        assert_eq!(
            back.annotations.autosave_max_interval,
            config.annotations.autosave_max_interval
        );
    }
}
