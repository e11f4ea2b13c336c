//! Configuration management with environment variable support

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::monitoring::MonitoringConfig;

// ---------------------------------------------------------------------------
// Queue policy settings
// ---------------------------------------------------------------------------

/// What happens to a request that outlives its queue timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Fail the request with a timeout error.
    #[default]
    Reject,
    /// Keep the request but move it behind every non-expired request of its level.
    Delay,
}

/// What happens when a level is at its `max_queue_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowAction {
    /// Reject the arriving request.
    #[default]
    RejectNew,
    /// Evict (and fail) the oldest request of the level, then accept the new one.
    EvictOldest,
}

/// Per-priority-level queue policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePolicyConfig {
    /// Maximum number of pending requests at the level; 0 means unbounded.
    pub max_queue_size: usize,
    /// How long a request may wait before `timeout_action` applies; zero disables.
    #[serde(with = "duration_micros")]
    pub default_timeout: Duration,
    pub timeout_action: TimeoutAction,
    /// Whether a request-specified timeout replaces `default_timeout`.
    pub allow_timeout_override: bool,
    pub overflow_action: OverflowAction,
}

impl Default for QueuePolicyConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 0,
            default_timeout: Duration::ZERO,
            timeout_action: TimeoutAction::Reject,
            allow_timeout_override: false,
            overflow_action: OverflowAction::RejectNew,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler settings
// ---------------------------------------------------------------------------

/// How a forming payload treats reaching a preferred batch size that is not
/// the largest one configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PreferredBatchPolicy {
    /// Keep waiting (bounded by `max_queue_delay`) for the largest preferred size.
    #[default]
    WaitForLarger,
    /// Cut as soon as any preferred size is reached.
    CutAtPreferred,
}

impl FromStr for PreferredBatchPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wait_for_larger" | "wait" => Ok(PreferredBatchPolicy::WaitForLarger),
            "cut_at_preferred" | "cut" => Ok(PreferredBatchPolicy::CutAtPreferred),
            _ => anyhow::bail!("Unknown preferred batch policy: {}", s),
        }
    }
}

/// Batching configuration for one model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Model name used as a metrics label and in log fields.
    pub model_name: String,
    pub dynamic_batching: bool,
    pub max_batch_size: usize,
    pub preferred_batch_sizes: BTreeSet<usize>,
    #[serde(with = "duration_micros")]
    pub max_queue_delay: Duration,
    pub preferred_policy: PreferredBatchPolicy,
    /// Whether the model declares optional inputs; if so, only requests
    /// providing the same set of inputs may share a payload.
    pub has_optional_inputs: bool,
    /// Number of priority levels; 0 disables priorities (single implicit level).
    pub priority_levels: u32,
    pub default_priority_level: u32,
    pub preserve_ordering: bool,
    pub response_cache: bool,
    /// Upper bound on how long dispatch waits for an execution ticket.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "option_duration_millis"
    )]
    pub admission_timeout: Option<Duration>,
    /// Inputs whose shapes must match across a payload. `true` marks a shape
    /// tensor whose values must match as well.
    pub enforce_equal_shape_tensors: HashMap<String, bool>,
    pub default_queue_policy: QueuePolicyConfig,
    /// Policy overrides keyed by priority level.
    pub queue_policies: BTreeMap<String, QueuePolicyConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            model_name: "default".to_string(),
            dynamic_batching: true,
            max_batch_size: 8,
            preferred_batch_sizes: BTreeSet::new(),
            max_queue_delay: Duration::from_micros(1_000),
            preferred_policy: PreferredBatchPolicy::WaitForLarger,
            has_optional_inputs: false,
            priority_levels: 0,
            default_priority_level: 0,
            preserve_ordering: false,
            response_cache: false,
            admission_timeout: None,
            enforce_equal_shape_tensors: HashMap::new(),
            default_queue_policy: QueuePolicyConfig::default(),
            queue_policies: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Largest configured preferred batch size, if any.
    pub fn max_preferred_batch_size(&self) -> Option<usize> {
        self.preferred_batch_sizes.last().copied()
    }

    /// Whether the scheduler keeps one queue per priority level.
    pub fn priorities_enabled(&self) -> bool {
        self.priority_levels > 0
    }

    /// Map a request priority to the queue level it is stored at.
    ///
    /// Priority 0 and priorities above `priority_levels` fall back to the
    /// default level; without priorities everything lands on level 0.
    pub fn effective_level(&self, priority: u32) -> u32 {
        if !self.priorities_enabled() {
            0
        } else if priority == 0 || priority > self.priority_levels {
            self.default_priority_level
        } else {
            priority
        }
    }

    /// Queue policy for a level, falling back to the default policy.
    pub fn policy_for(&self, level: u32) -> &QueuePolicyConfig {
        self.queue_policies.get(&level.to_string()).unwrap_or(&self.default_queue_policy)
    }

    /// All levels the queue holds, highest priority first.
    pub fn levels(&self) -> Vec<u32> {
        if self.priorities_enabled() { (1..=self.priority_levels).collect() } else { vec![0] }
    }

    /// Validate the batching settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            anyhow::bail!("Max batch size must be at least 1");
        }

        for &size in &self.preferred_batch_sizes {
            if size == 0 {
                anyhow::bail!("Preferred batch sizes must be at least 1");
            }
            if size > self.max_batch_size {
                anyhow::bail!(
                    "Preferred batch size {} exceeds max batch size {}",
                    size,
                    self.max_batch_size
                );
            }
        }

        if self.priorities_enabled() {
            if self.default_priority_level == 0
                || self.default_priority_level > self.priority_levels
            {
                anyhow::bail!(
                    "Default priority level {} must be within 1..={}",
                    self.default_priority_level,
                    self.priority_levels
                );
            }
        } else if !self.queue_policies.is_empty() {
            anyhow::bail!("Per-level queue policies require priority_levels > 0");
        }

        for key in self.queue_policies.keys() {
            let level: u32 = key
                .parse()
                .with_context(|| format!("Queue policy key '{}' is not a priority level", key))?;
            if level == 0 || level > self.priority_levels {
                anyhow::bail!(
                    "Queue policy defined for level {} outside 1..={}",
                    level,
                    self.priority_levels
                );
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Complete configuration and builder
// ---------------------------------------------------------------------------

/// Complete service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub scheduler: SchedulerConfig,
    pub monitoring: MonitoringConfig,
}

/// Configuration builder with environment variable support
pub struct ConfigBuilder {
    config: ServiceConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self { config: ServiceConfig::default() }
    }

    /// Load configuration from environment variables
    pub fn from_env(mut self) -> Result<Self> {
        let scheduler = &mut self.config.scheduler;

        if let Ok(enabled) = env::var("DYNBATCH_DYNAMIC_BATCHING") {
            scheduler.dynamic_batching = enabled.parse()?;
        }

        if let Ok(batch_size) = env::var("DYNBATCH_MAX_BATCH_SIZE") {
            scheduler.max_batch_size = batch_size.parse()?;
        }

        if let Ok(sizes) = env::var("DYNBATCH_PREFERRED_BATCH_SIZES") {
            scheduler.preferred_batch_sizes = sizes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<usize>())
                .collect::<Result<_, _>>()?;
        }

        if let Ok(delay) = env::var("DYNBATCH_MAX_QUEUE_DELAY_US") {
            scheduler.max_queue_delay = Duration::from_micros(delay.parse()?);
        }

        if let Ok(policy) = env::var("DYNBATCH_PREFERRED_POLICY") {
            scheduler.preferred_policy = policy.parse()?;
        }

        if let Ok(levels) = env::var("DYNBATCH_PRIORITY_LEVELS") {
            scheduler.priority_levels = levels.parse()?;
        }

        if let Ok(level) = env::var("DYNBATCH_DEFAULT_PRIORITY_LEVEL") {
            scheduler.default_priority_level = level.parse()?;
        }

        if let Ok(preserve) = env::var("DYNBATCH_PRESERVE_ORDERING") {
            scheduler.preserve_ordering = preserve.parse()?;
        }

        if let Ok(cache) = env::var("DYNBATCH_RESPONSE_CACHE") {
            scheduler.response_cache = cache.parse()?;
        }

        if let Ok(timeout) = env::var("DYNBATCH_ADMISSION_TIMEOUT_MS") {
            scheduler.admission_timeout = Some(Duration::from_millis(timeout.parse()?));
        }

        if let Ok(level) = env::var("DYNBATCH_LOG_LEVEL") {
            self.config.monitoring.log_level = level;
        }

        Ok(self)
    }

    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        self.config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(self)
    }

    /// Override scheduler config
    pub fn with_scheduler(mut self, config: SchedulerConfig) -> Self {
        self.config.scheduler = config;
        self
    }

    /// Override monitoring config
    pub fn with_monitoring(mut self, config: MonitoringConfig) -> Self {
        self.config.monitoring = config;
        self
    }

    /// Validate configuration
    pub fn validate(self) -> Result<Self> {
        self.config.scheduler.validate()?;
        Ok(self)
    }

    /// Build the final configuration
    pub fn build(self) -> ServiceConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration from multiple sources with precedence:
/// 1. Environment variables (highest precedence)
/// 2. Configuration file
/// 3. Default values (lowest precedence)
pub fn load_config() -> Result<ServiceConfig> {
    let mut builder = ConfigBuilder::new();

    if let Ok(config_file) = env::var("DYNBATCH_CONFIG_FILE") {
        if Path::new(&config_file).exists() {
            builder = builder.from_file(config_file)?;
        }
    } else {
        for default_path in &["dynbatch.toml", "config/dynbatch.toml"] {
            if Path::new(default_path).exists() {
                builder = builder.from_file(default_path)?;
                break;
            }
        }
    }

    builder = builder.from_env()?;

    Ok(builder.validate()?.build())
}

/// Generate example configuration file
pub fn generate_example_config() -> String {
    let config = ServiceConfig::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Failed to generate config".to_string())
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_micros {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_micros() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let micros = u64::deserialize(d)?;
        Ok(Duration::from_micros(micros))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_u64(d.as_millis() as u64),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
