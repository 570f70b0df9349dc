//! Processor and replay configuration.

/// Configuration for applying operations.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Atomic operations with more members are rejected.
    pub max_atomic_ops: usize,
    /// Check height, previous head and previous key-op pointers against the
    /// prior state.
    pub verify_linkage: bool,
    /// Import key-share material addressed to contracts whose reply keys are
    /// held locally.
    pub import_shared_keys: bool,
    /// Stop processing a contract after a fatal error.
    pub quarantine_on_fatal: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_atomic_ops: crate::op::MAX_ATOMIC_OPS,
            verify_linkage: true,
            import_shared_keys: true,
            quarantine_on_fatal: true,
        }
    }
}

/// Configuration for the [`Contracts`](crate::Contracts) boundary.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub processor: ProcessorConfig,
    /// Retry deferred actions when missing keys are fetched.
    pub retry_deferred: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            retry_deferred: true,
        }
    }
}
