use galaxy_core::{GalaxyError, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of lines kept before I/S lines are evicted
    pub max_capacity: usize,
    /// Largest line payload accepted by a local operation
    pub max_item_size: usize,
    /// How long the blocking entry points wait for a pending operation
    pub op_timeout: Duration,
    /// Deadline of a single protocol request before it is timed out
    pub request_timeout: Duration,
    /// Number of fresh ids requested from the allocator at a time
    pub ref_batch_size: u64,
    /// Period of the background deadline sweep
    pub timeout_sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
            max_item_size: 1024 * 1024,
            op_timeout: Duration::from_millis(5000),
            request_timeout: Duration::from_millis(2000),
            ref_batch_size: 1000,
            timeout_sweep_interval: Duration::from_millis(250),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_capacity(mut self, capacity: usize) -> Self {
        self.max_capacity = capacity;
        self
    }

    pub fn with_max_item_size(mut self, size: usize) -> Self {
        self.max_item_size = size;
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_ref_batch_size(mut self, size: u64) -> Self {
        self.ref_batch_size = size;
        self
    }

    pub fn with_timeout_sweep_interval(mut self, interval: Duration) -> Self {
        self.timeout_sweep_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_capacity == 0 {
            return Err(GalaxyError::invalid_operation(
                "max_capacity must be at least 1",
            ));
        }
        if self.max_item_size == 0 {
            return Err(GalaxyError::invalid_operation(
                "max_item_size must be at least 1",
            ));
        }
        if self.ref_batch_size < 2 {
            return Err(GalaxyError::invalid_operation(
                "ref_batch_size must be at least 2 so refills can overlap",
            ));
        }
        if self.op_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(GalaxyError::invalid_operation("timeouts must be non-zero"));
        }
        if self.timeout_sweep_interval.is_zero() {
            return Err(GalaxyError::invalid_operation(
                "timeout_sweep_interval must be non-zero",
            ));
        }
        Ok(())
    }
}
