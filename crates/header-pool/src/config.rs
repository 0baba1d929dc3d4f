use crate::error::PoolError;
use crate::layout::{PoolSize, max_peers_for_size};

/// Default number of peers a pool is sized for.
pub const DEFAULT_DESIRED_PEERS: u32 = 20;

/// Default maximum serialized header size in bytes.
pub const DEFAULT_MAX_HEADER_SIZE: u32 = 512;

/// Configuration for creating or attaching to a header pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of peers the pool should be able to buffer one header for.
    /// Only used to pick the buffer size; the real slot count is derived
    /// from the size.
    pub desired_peers: u32,
    /// Width of every header slot in bytes.
    pub max_header_size: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            desired_peers: DEFAULT_DESIRED_PEERS,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
        }
    }
}

impl PoolConfig {
    pub fn with_desired_peers(mut self, desired_peers: u32) -> Self {
        self.desired_peers = desired_peers;
        self
    }

    pub fn with_max_header_size(mut self, max_header_size: u32) -> Self {
        self.max_header_size = max_header_size;
        self
    }

    /// Check that at least one slot fits in the buffer [`Self::optimal_size`]
    /// picks, which is what a new harvester allocates.
    pub fn validate(&self) -> Result<(), PoolError> {
        self.validate_for(self.optimal_size())
    }

    /// Check that at least one slot fits in a buffer of `size`.
    pub fn validate_for(&self, size: PoolSize) -> Result<(), PoolError> {
        if self.max_header_size == 0 {
            return Err(PoolError::InvalidConfig("max_header_size must be > 0"));
        }
        if max_peers_for_size(self.max_header_size, size) == 0 {
            return Err(PoolError::InvalidConfig(
                "max_header_size leaves no room for a single slot",
            ));
        }
        Ok(())
    }

    /// The buffer size a harvester allocates for this configuration.
    pub fn optimal_size(&self) -> PoolSize {
        PoolSize::optimal(self.desired_peers, self.max_header_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.desired_peers, 20);
        assert_eq!(config.max_header_size, 512);
        assert!(config.validate().is_ok());
        // 20 * 512 = 10240 > 8192
        assert_eq!(config.optimal_size(), PoolSize::Kb16);
    }

    #[test]
    fn rejects_zero_header_size() {
        let config = PoolConfig::default().with_max_header_size(0);
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_header_that_only_fits_a_larger_pool() {
        let config = PoolConfig::default()
            .with_desired_peers(1)
            .with_max_header_size(8180);
        assert_eq!(config.optimal_size(), PoolSize::Kb8);
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(_))
        ));
        assert!(config.validate_for(PoolSize::Kb16).is_ok());
    }

    #[test]
    fn rejects_header_larger_than_any_pool() {
        let config = PoolConfig::default().with_max_header_size(70_000);
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(_))
        ));
    }
}
