//! Knowledge base configuration.

use std::time::Duration;

/// How a query cache stores its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryCacheStrategy {
    /// Keep resolved items.
    #[default]
    Values,
    /// Keep only keys and resolve them on every read.
    Ids,
}

/// Configuration for opening a knowledge base.
#[derive(Debug, Clone)]
pub struct KbConfig {
    /// Whether transactions must name a non-empty author.
    pub author_required: bool,

    /// Base number of ids reserved per durable round trip.
    pub id_chunk_size: u64,

    /// Upper bound for the adaptive chunk multiplier.
    pub id_max_multiplier: u64,

    /// Reservations closer together than this grow the next chunk.
    pub id_ramp_window: Duration,

    /// Update events kept for polling.
    pub feed_history: usize,

    /// Default strategy of new query caches.
    pub query_cache_strategy: QueryCacheStrategy,

    /// Whether `cleanup` drops arena entries nobody else references.
    pub evict_unreferenced: bool,

    /// Whether branches may be created.
    pub branching: bool,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            author_required: false,
            id_chunk_size: 64,
            id_max_multiplier: 32,
            id_ramp_window: Duration::from_secs(1),
            feed_history: 1024,
            query_cache_strategy: QueryCacheStrategy::Values,
            evict_unreferenced: true,
            branching: true,
        }
    }
}

impl KbConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether an author is required.
    #[must_use]
    pub const fn author_required(mut self, value: bool) -> Self {
        self.author_required = value;
        self
    }

    /// Sets the base id chunk size.
    #[must_use]
    pub const fn id_chunk_size(mut self, size: u64) -> Self {
        self.id_chunk_size = size;
        self
    }

    /// Sets the maximum chunk multiplier.
    #[must_use]
    pub const fn id_max_multiplier(mut self, value: u64) -> Self {
        self.id_max_multiplier = value;
        self
    }

    /// Sets the chunk ramp window.
    #[must_use]
    pub const fn id_ramp_window(mut self, window: Duration) -> Self {
        self.id_ramp_window = window;
        self
    }

    /// Sets the number of events kept for polling.
    #[must_use]
    pub const fn feed_history(mut self, events: usize) -> Self {
        self.feed_history = events;
        self
    }

    /// Sets the default query cache strategy.
    #[must_use]
    pub const fn query_cache_strategy(mut self, strategy: QueryCacheStrategy) -> Self {
        self.query_cache_strategy = strategy;
        self
    }

    /// Sets whether cleanup evicts unreferenced items.
    #[must_use]
    pub const fn evict_unreferenced(mut self, value: bool) -> Self {
        self.evict_unreferenced = value;
        self
    }

    /// Sets whether branching is enabled.
    #[must_use]
    pub const fn branching(mut self, value: bool) -> Self {
        self.branching = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = KbConfig::default();
        assert!(!config.author_required);
        assert_eq!(config.id_chunk_size, 64);
        assert_eq!(config.id_max_multiplier, 32);
        assert_eq!(config.query_cache_strategy, QueryCacheStrategy::Values);
        assert!(config.branching);
    }

    #[test]
    fn builder_pattern() {
        let config = KbConfig::new()
            .author_required(true)
            .id_chunk_size(8)
            .query_cache_strategy(QueryCacheStrategy::Ids)
            .branching(false);

        assert!(config.author_required);
        assert_eq!(config.id_chunk_size, 8);
        assert_eq!(config.query_cache_strategy, QueryCacheStrategy::Ids);
        assert!(!config.branching);
    }
}
