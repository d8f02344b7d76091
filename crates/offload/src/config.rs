//! Scheduler configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-task time budget
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Upper bound on units per task type when concurrency is not set explicitly
pub const DEFAULT_MAX_UNITS_PER_TYPE: usize = 4;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Time budget applied when a submission does not set one
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,

    /// Retry budget applied when a submission does not set one
    pub default_max_retries: u32,

    /// Cap applied to hardware parallelism when sizing pools
    pub max_units_per_type: usize,

    /// Capacity of the internal unit event channel
    pub event_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TASK_TIMEOUT,
            default_max_retries: DEFAULT_MAX_RETRIES,
            max_units_per_type: DEFAULT_MAX_UNITS_PER_TYPE,
            event_channel_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    ///
    /// - `OFFLOAD_TASK_TIMEOUT_MS`
    /// - `OFFLOAD_MAX_RETRIES`
    /// - `OFFLOAD_MAX_UNITS_PER_TYPE`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let default_timeout = std::env::var("OFFLOAD_TASK_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.default_timeout);

        let default_max_retries = std::env::var("OFFLOAD_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.default_max_retries);

        let max_units_per_type = std::env::var("OFFLOAD_MAX_UNITS_PER_TYPE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .map(|n| n.max(1))
            .unwrap_or(defaults.max_units_per_type);

        Self {
            default_timeout,
            default_max_retries,
            max_units_per_type,
            ..defaults
        }
    }

    /// Set the default task timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the default retry budget
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    /// Set the per-type unit cap
    pub fn with_max_units_per_type(mut self, max: usize) -> Self {
        self.max_units_per_type = max.max(1);
        self
    }

    /// Set the unit event channel capacity
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }
}

/// Per task type pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of units to create. `None` sizes from hardware parallelism.
    pub concurrency: Option<usize>,
}

impl PoolConfig {
    /// Pool sized from hardware parallelism
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool with an explicit unit count
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: Some(concurrency),
        }
    }

    /// Resolve the number of units to create
    ///
    /// An explicit concurrency is honoured as given (zero yields an empty
    /// pool served by the fallback path).
    pub fn resolved_concurrency(&self, max_units_per_type: usize) -> usize {
        match self.concurrency {
            Some(n) => n,
            None => {
                let parallelism = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                parallelism.min(max_units_per_type).max(1)
            }
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
