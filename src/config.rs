use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Groups with at least this many members go to the worker pool
    pub parallel_threshold: usize,
    /// Worker pool size; 0 disables the pool
    pub worker_threads: usize,
    /// Per-aggregation deadline
    #[serde(with = "duration_serde::option")]
    pub deadline: Option<Duration>,
    /// Cached results; 0 disables the cache
    pub cache_capacity: u64,
    #[serde(with = "duration_serde")]
    pub cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: 1000,
            worker_threads: num_cpus::get(),
            deadline: None,
            cache_capacity: 256,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    /// Fully synchronous, uncached configuration
    pub fn synchronous() -> Self {
        Self {
            worker_threads: 0,
            cache_capacity: 0,
            ..Self::default()
        }
    }

    /// Read overrides from the environment
    /// SHOAL_PARALLEL_THRESHOLD=1000
    /// SHOAL_WORKER_THREADS=8
    /// SHOAL_DEADLINE_MS=5000
    /// SHOAL_CACHE_CAPACITY=256
    /// SHOAL_CACHE_TTL_SECS=300
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with a custom variable source.
    /// Unparseable values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.trim().parse().ok())
        }

        let defaults = Self::default();
        Self {
            parallel_threshold: parsed(lookup("SHOAL_PARALLEL_THRESHOLD"))
                .unwrap_or(defaults.parallel_threshold),
            worker_threads: parsed(lookup("SHOAL_WORKER_THREADS")).unwrap_or(defaults.worker_threads),
            deadline: parsed::<u64>(lookup("SHOAL_DEADLINE_MS"))
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .or(defaults.deadline),
            cache_capacity: parsed(lookup("SHOAL_CACHE_CAPACITY")).unwrap_or(defaults.cache_capacity),
            cache_ttl: parsed::<u64>(lookup("SHOAL_CACHE_TTL_SECS"))
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn parallel_enabled(&self) -> bool {
        self.worker_threads > 0
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_capacity > 0
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct DurationHelper {
        secs: u64,
        #[serde(default)]
        nanos: u32,
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        DurationHelper {
            secs: duration.as_secs(),
            nanos: duration.subsec_nanos(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let helper = DurationHelper::deserialize(deserializer)?;
        Ok(Duration::new(helper.secs, helper.nanos))
    }

    pub mod option {
        use super::DurationHelper;
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration
                .map(|d| DurationHelper {
                    secs: d.as_secs(),
                    nanos: d.subsec_nanos(),
                })
                .serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let helper = Option::<DurationHelper>::deserialize(deserializer)?;
            Ok(helper.map(|h| Duration::new(h.secs, h.nanos)))
        }
    }
}
