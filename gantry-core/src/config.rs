//! Process-wide runtime tuning.

use serde::Deserialize;

/// Tuning knobs for the scheduler and buffer pool. Field names map to the
/// process configuration keys (`nbthread`, `runqueue-depth`, `bufsize`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Worker threads. 1..=64.
    pub nbthread: usize,
    /// Max tasks run per scheduler pass.
    pub runqueue_depth: usize,
    /// Size of each pooled buffer in bytes.
    pub bufsize: usize,
    /// Total buffers in the pool.
    pub pool_buffers: usize,
    /// Headroom kept when offering freed buffers to waiters.
    pub pool_reserve: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            nbthread: 1,
            runqueue_depth: 200,
            bufsize: 16_384,
            pool_buffers: 1_024,
            pool_reserve: 2,
        }
    }
}

/// Rejected [`RuntimeConfig`] values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NbThreadRange(usize),
    RunQueueDepthZero,
    BufSizeTooSmall(usize),
    PoolTooSmall(usize),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NbThreadRange(n) => write!(f, "nbthread {n} outside 1..=64"),
            Self::RunQueueDepthZero => write!(f, "runqueue-depth must be positive"),
            Self::BufSizeTooSmall(n) => write!(f, "bufsize {n} below minimum 1024"),
            Self::PoolTooSmall(n) => write!(f, "pool of {n} buffers cannot satisfy reserve"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl RuntimeConfig {
    /// Validates ranges; call after deserializing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nbthread < 1 || self.nbthread > 64 {
            return Err(ConfigError::NbThreadRange(self.nbthread));
        }
        if self.runqueue_depth == 0 {
            return Err(ConfigError::RunQueueDepthZero);
        }
        if self.bufsize < 1_024 {
            return Err(ConfigError::BufSizeTooSmall(self.bufsize));
        }
        if self.pool_buffers <= self.pool_reserve {
            return Err(ConfigError::PoolTooSmall(self.pool_buffers));
        }
        Ok(())
    }
}
