//! Engine configuration.
//!
//! The engine is configured from a flat key-value map, usually the same map
//! that carries the capture source's settings. Keys the engine does not know
//! are left for the source and only logged at debug level.
//!
//! ```rust,ignore
//! use cdcflow_core::EngineConfig;
//!
//! let config = EngineConfig::from_properties([
//!     ("queue.capacity", "500"),
//!     ("worker.count", "2"),
//!     ("conflict.resolution", "target_wins"),
//! ])?;
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::TableId;
use std::time::Duration;
use tracing::debug;

/// How update writes treat a row that already exists in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// The source image overwrites the target row.
    #[default]
    SourceWins,
    /// An existing target row is kept; updates only insert missing rows.
    TargetWins,
}

impl ConflictPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "source_wins" => Some(Self::SourceWins),
            "target_wins" => Some(Self::TargetWins),
            _ => None,
        }
    }
}

/// Include/exclude lists deciding which tables are processed.
///
/// An empty include list admits every table. Exclusion wins over inclusion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    /// Tables to process; empty means all.
    pub include: Vec<String>,
    /// Tables to skip.
    pub exclude: Vec<String>,
}

impl TableFilter {
    /// Returns true if events of `table` should be processed.
    #[must_use]
    pub fn admits(&self, table: &TableId) -> bool {
        if self.exclude.iter().any(|p| table.matches(p)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| table.matches(p))
    }

    fn parse_list(value: &str) -> Vec<String> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Retry behavior for transient sink failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per event, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with `max_attempts` total attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay before attempt number `attempt` (0-indexed; attempt 0 runs
    /// immediately).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // Whole nanoseconds keep the capped values exact.
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_nanos =
            self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let delay_nanos = base_nanos.min(self.max_delay.as_nanos() as f64);

        let total = if self.add_jitter {
            delay_nanos + delay_nanos * 0.25 * jitter_fraction()
        } else {
            delay_nanos
        };
        Duration::from_nanos(total as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Pseudo-random value in [0, 1) from the clock's sub-second nanos.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

/// Configuration of one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total buffered events across all partitions.
    pub queue_capacity: usize,
    /// Number of worker partitions.
    pub worker_count: usize,
    /// Transient-failure retry policy.
    pub retry: RetryConfig,
    /// How long one event may keep failing transiently before the sink is
    /// declared unavailable.
    pub sink_write_timeout: Duration,
    /// How long the sink may stay unavailable before the engine fails.
    pub sink_unavailable_max: Duration,
    /// Interval between offset commits.
    pub offset_commit_interval: Duration,
    /// How long the bridge blocks on a full queue.
    pub backpressure_max_block: Duration,
    /// How long `stop` waits for the queues to drain.
    pub shutdown_grace: Duration,
    /// Interval between statistics log lines.
    pub stats_log_interval: Duration,
    /// Whether deletes are written to the sink.
    pub apply_deletes: bool,
    /// Update conflict policy.
    pub conflict_policy: ConflictPolicy,
    /// Tables to process.
    pub table_filter: TableFilter,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            worker_count: 4,
            retry: RetryConfig::default(),
            sink_write_timeout: Duration::from_secs(30),
            sink_unavailable_max: Duration::from_secs(300),
            offset_commit_interval: Duration::from_secs(10),
            backpressure_max_block: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            stats_log_interval: Duration::from_secs(60),
            apply_deletes: true,
            conflict_policy: ConflictPolicy::SourceWins,
            table_filter: TableFilter::default(),
        }
    }
}

impl EngineConfig {
    /// Builds a configuration from flat key-value properties.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] naming the first key whose value
    /// cannot be parsed or is out of range, or `queue.capacity` if it is
    /// smaller than `worker.count`.
    pub fn from_properties<I, K, V>(properties: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in properties {
            let key = key.as_ref();
            let value = value.as_ref().trim();
            match key {
                "queue.capacity" => config.queue_capacity = parse_at_least_one(key, value)?,
                "worker.count" => config.worker_count = parse_at_least_one(key, value)?,
                "retry.max.attempts" => {
                    let attempts: u32 = parse_number(key, value)?;
                    if attempts == 0 {
                        return Err(CoreError::invalid_config(key, "must be at least 1"));
                    }
                    config.retry.max_attempts = attempts;
                }
                "retry.backoff.ms" => config.retry.initial_delay = parse_millis(key, value)?,
                "retry.backoff.max.ms" => config.retry.max_delay = parse_millis(key, value)?,
                "sink.write.timeout.ms" => config.sink_write_timeout = parse_millis(key, value)?,
                "sink.unavailable.max.ms" => {
                    config.sink_unavailable_max = parse_millis(key, value)?;
                }
                "offset.commit.interval.ms" => {
                    config.offset_commit_interval = parse_millis(key, value)?;
                }
                "backpressure.max.block.ms" => {
                    config.backpressure_max_block = parse_millis(key, value)?;
                }
                "shutdown.grace.ms" => config.shutdown_grace = parse_millis(key, value)?,
                "stats.log.interval.ms" => config.stats_log_interval = parse_millis(key, value)?,
                "apply.deletes" => {
                    config.apply_deletes = match value {
                        "true" => true,
                        "false" => false,
                        _ => {
                            return Err(CoreError::invalid_config(
                                key,
                                format!("expected true or false, got `{value}`"),
                            ))
                        }
                    };
                }
                "conflict.resolution" => {
                    config.conflict_policy = ConflictPolicy::parse(value).ok_or_else(|| {
                        CoreError::invalid_config(
                            key,
                            format!("expected source_wins or target_wins, got `{value}`"),
                        )
                    })?;
                }
                "table.include.list" => config.table_filter.include = TableFilter::parse_list(value),
                "table.exclude.list" => config.table_filter.exclude = TableFilter::parse_list(value),
                other => debug!(key = other, "ignoring unknown configuration key"),
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks settings that depend on each other.
    ///
    /// Every partition queue holds at least one event, so `queue.capacity`
    /// must cover one slot per worker for the total to stay within it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] for `queue.capacity` if it is
    /// smaller than `worker.count`.
    pub fn validate(&self) -> CoreResult<()> {
        if self.queue_capacity < self.worker_count {
            return Err(CoreError::invalid_config(
                "queue.capacity",
                format!(
                    "{} is smaller than worker.count {}",
                    self.queue_capacity, self.worker_count
                ),
            ));
        }
        Ok(())
    }

    /// Capacity of each partition queue. Summed over the partitions it never
    /// exceeds `queue_capacity` once [`EngineConfig::validate`] passes.
    #[must_use]
    pub fn partition_capacity(&self) -> usize {
        (self.queue_capacity / self.worker_count.max(1)).max(1)
    }

    /// Sets the total queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Sets the number of workers.
    #[must_use]
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the transient-failure streak that marks the sink unavailable.
    #[must_use]
    pub fn with_sink_write_timeout(mut self, timeout: Duration) -> Self {
        self.sink_write_timeout = timeout;
        self
    }

    /// Sets how long the sink may stay unavailable.
    #[must_use]
    pub fn with_sink_unavailable_max(mut self, max: Duration) -> Self {
        self.sink_unavailable_max = max;
        self
    }

    /// Sets the offset commit interval.
    #[must_use]
    pub fn with_offset_commit_interval(mut self, interval: Duration) -> Self {
        self.offset_commit_interval = interval;
        self
    }

    /// Sets the backpressure block limit.
    #[must_use]
    pub fn with_backpressure_max_block(mut self, max: Duration) -> Self {
        self.backpressure_max_block = max;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the statistics log interval.
    #[must_use]
    pub fn with_stats_log_interval(mut self, interval: Duration) -> Self {
        self.stats_log_interval = interval;
        self
    }

    /// Enables or disables delete propagation.
    #[must_use]
    pub fn with_apply_deletes(mut self, apply: bool) -> Self {
        self.apply_deletes = apply;
        self
    }

    /// Sets the update conflict policy.
    #[must_use]
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the table filter.
    #[must_use]
    pub fn with_table_filter(mut self, filter: TableFilter) -> Self {
        self.table_filter = filter;
        self
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> CoreResult<T> {
    value
        .parse()
        .map_err(|_| CoreError::invalid_config(key, format!("`{value}` is not a valid number")))
}

fn parse_at_least_one(key: &str, value: &str) -> CoreResult<usize> {
    let n: usize = parse_number(key, value)?;
    if n == 0 {
        return Err(CoreError::invalid_config(key, "must be at least 1"));
    }
    Ok(n)
}

fn parse_millis(key: &str, value: &str) -> CoreResult<Duration> {
    parse_number::<u64>(key, value).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.offset_commit_interval, Duration::from_secs(10));
        assert!(config.apply_deletes);
        assert_eq!(config.conflict_policy, ConflictPolicy::SourceWins);
        assert_eq!(config.partition_capacity(), 2500);
    }

    #[test]
    fn from_properties_overrides() {
        let config = EngineConfig::from_properties([
            ("queue.capacity", "8"),
            ("worker.count", "3"),
            ("retry.max.attempts", "5"),
            ("retry.backoff.ms", "10"),
            ("sink.write.timeout.ms", "250"),
            ("apply.deletes", "false"),
            ("conflict.resolution", "target_wins"),
            ("table.include.list", "public.orders, customers"),
            ("table.exclude.list", "audit"),
            ("database.hostname", "db.internal"),
        ])
        .unwrap();

        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.partition_capacity(), 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(10));
        assert_eq!(config.sink_write_timeout, Duration::from_millis(250));
        assert!(!config.apply_deletes);
        assert_eq!(config.conflict_policy, ConflictPolicy::TargetWins);
        assert_eq!(config.table_filter.include, vec!["public.orders", "customers"]);
    }

    #[test]
    fn bad_values_name_the_key() {
        let cases = [
            ("queue.capacity", "0"),
            ("worker.count", "many"),
            ("retry.max.attempts", "0"),
            ("offset.commit.interval.ms", "-1"),
            ("apply.deletes", "yes"),
            ("conflict.resolution", "last_writer"),
        ];
        for (key, value) in cases {
            match EngineConfig::from_properties([(key, value)]) {
                Err(CoreError::InvalidConfig { key: k, .. }) => assert_eq!(k, key),
                other => panic!("{key}={value}: expected InvalidConfig, got {other:?}"),
            }
        }
    }

    #[test]
    fn capacity_below_worker_count_is_rejected() {
        let config = EngineConfig::default()
            .with_queue_capacity(2)
            .with_worker_count(4);
        match config.validate() {
            Err(CoreError::InvalidConfig { key, .. }) => assert_eq!(key, "queue.capacity"),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }

        let parsed = EngineConfig::from_properties([("queue.capacity", "2"), ("worker.count", "4")]);
        assert!(matches!(parsed, Err(CoreError::InvalidConfig { .. })));
    }

    #[test]
    fn partitions_never_buffer_more_than_capacity() {
        for workers in 1..=8 {
            for capacity in workers..=40 {
                let config = EngineConfig::default()
                    .with_queue_capacity(capacity)
                    .with_worker_count(workers);
                config.validate().unwrap();
                assert!(config.partition_capacity() >= 1);
                assert!(config.partition_capacity() * workers <= capacity);
            }
        }
    }

    #[test]
    fn table_filter_rules() {
        let all = TableFilter::default();
        assert!(all.admits(&TableId::new("public.orders")));

        let filter = TableFilter {
            include: vec!["public.orders".into(), "customers".into()],
            exclude: vec!["customers".into()],
        };
        assert!(filter.admits(&TableId::new("public.orders")));
        assert!(!filter.admits(&TableId::new("public.customers")));
        assert!(!filter.admits(&TableId::new("public.audit")));
    }

    #[test]
    fn retry_delays_grow_and_cap() {
        let retry = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300))
            .with_jitter(false);
        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let retry = RetryConfig::new(3).with_initial_delay(Duration::from_millis(100));
        for _ in 0..20 {
            let delay = retry.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn no_retry_means_one_attempt() {
        assert_eq!(RetryConfig::no_retry().max_attempts, 1);
        assert_eq!(RetryConfig::new(0).max_attempts, 1);
    }
}
