//! Cache Configuration

/// Resource cache configuration options
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Hotness at or below which a fully loaded, externally unreferenced
    /// resource is evicted by `collect_infrequently_used`
    pub hotness_floor: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { hotness_floor: 0.5 }
    }
}
