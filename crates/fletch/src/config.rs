//! Process-wide runtime configuration. Every key is registered once in a
//! static registry; getters are lock-free atomic reads so the hot query path
//! can consult them per record.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use once_cell::sync::Lazy;

use crate::error::{Result, UserError};

pub struct NumberSetting {
    name: &'static str,
    min: u64,
    max: u64,
    value: AtomicU64,
}

impl NumberSetting {
    const fn new(name: &'static str, default: u64, min: u64, max: u64) -> Self {
        Self { name, min, max, value: AtomicU64::new(default) }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u64) -> Result<()> {
        if value < self.min || value > self.max {
            return Err(UserError::ConfigValueOutOfRange {
                name: self.name,
                min: self.min.to_string(),
                max: self.max.to_string(),
            }
            .into());
        }
        self.value.store(value, Ordering::Relaxed);
        Ok(())
    }
}

pub struct FloatSetting {
    name: &'static str,
    min: f64,
    max: f64,
    bits: AtomicU64,
}

impl FloatSetting {
    fn new(name: &'static str, default: f64, min: f64, max: f64) -> Self {
        Self { name, min, max, bits: AtomicU64::new(default.to_bits()) }
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) -> Result<()> {
        if !(self.min..=self.max).contains(&value) {
            return Err(UserError::ConfigValueOutOfRange {
                name: self.name,
                min: self.min.to_string(),
                max: self.max.to_string(),
            }
            .into());
        }
        self.bits.store(value.to_bits(), Ordering::Relaxed);
        Ok(())
    }
}

pub struct BoolSetting {
    value: AtomicBool,
}

impl BoolSetting {
    const fn new(default: bool) -> Self {
        Self { value: AtomicBool::new(default) }
    }

    pub fn get(&self) -> bool {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: bool) {
        self.value.store(value, Ordering::Relaxed);
    }
}

pub static QUERY_STRING_DEPTH: NumberSetting =
    NumberSetting::new("query-string-depth", 1000, 1, u32::MAX as u64);
pub static QUERY_STRING_TERMS_COUNT: NumberSetting =
    NumberSetting::new("query-string-terms-count", 16, 1, 32);
pub static MAX_PREFIXES: NumberSetting = NumberSetting::new("max-prefixes", 8, 1, 16);
pub static MAX_TAG_FIELD_LENGTH: NumberSetting =
    NumberSetting::new("max-tag-field-length", 256, 1, 1 << 20);
pub static MAX_NUMERIC_FIELD_LENGTH: NumberSetting =
    NumberSetting::new("max-numeric-field-length", 128, 1, 1 << 20);
pub static MAX_VECTOR_ATTRIBUTES: NumberSetting =
    NumberSetting::new("max-vector-attributes", 50, 1, 100);
pub static MAX_VECTOR_DIMENSIONS: NumberSetting =
    NumberSetting::new("max-vector-dimensions", 32_768, 1, 64_000);
pub static MAX_VECTOR_M: NumberSetting = NumberSetting::new("max-vector-m", 2_000_000, 1, 1 << 32);
pub static MAX_VECTOR_EF_CONSTRUCTION: NumberSetting =
    NumberSetting::new("max-vector-ef-construction", 4096, 1, 1 << 32);
pub static MAX_VECTOR_EF_RUNTIME: NumberSetting =
    NumberSetting::new("max-vector-ef-runtime", 4096, 1, 1 << 32);
pub static DEFAULT_TIMEOUT_MS: NumberSetting =
    NumberSetting::new("default-timeout-ms", 50_000, 1, 60_000);
pub static MAX_KNN: NumberSetting = NumberSetting::new("max-knn", 10_000, 1, 100_000);
pub static MAX_TERM_EXPANSIONS: NumberSetting =
    NumberSetting::new("max-term-expansions", 200, 1, 100_000);
pub static READER_THREADS: NumberSetting = NumberSetting::new("reader-threads", 4, 1, 1024);
pub static WRITER_THREADS: NumberSetting = NumberSetting::new("writer-threads", 4, 1, 1024);
pub static UTILITY_THREADS: NumberSetting = NumberSetting::new("utility-threads", 4, 1, 1024);
pub static HNSW_BLOCK_SIZE: NumberSetting =
    NumberSetting::new("hnsw-block-size", 10_240, 0, u32::MAX as u64);
pub static ASYNC_FANOUT_THRESHOLD: NumberSetting =
    NumberSetting::new("async-fanout-threshold", 30, 1, 10_000);
pub static CLUSTER_MAP_EXPIRATION_MS: NumberSetting =
    NumberSetting::new("cluster-map-expiration-ms", 250, 0, 3_600_000);
pub static FT_INFO_TIMEOUT_MS: NumberSetting =
    NumberSetting::new("ft-info-timeout-ms", 5000, 100, 300_000);
pub static FT_INFO_RPC_TIMEOUT_MS: NumberSetting =
    NumberSetting::new("ft-info-rpc-timeout-ms", 2500, 100, 300_000);
pub static TIMEOUT_POLL_FREQUENCY: NumberSetting =
    NumberSetting::new("timeout-poll-frequency", 100, 1, u64::MAX);
pub static FANOUT_DATA_UNIFORMITY_PERCENT: NumberSetting =
    NumberSetting::new("fanout-data-uniformity-percent", 100, 0, 100);
pub static FANOUT_UNIFORMITY_MIN_INDEX_SIZE: NumberSetting =
    NumberSetting::new("fanout-uniformity-min-index-size", 1000, 0, u32::MAX as u64);
pub static MAX_SEARCH_RESULT_RECORD_SIZE: NumberSetting =
    NumberSetting::new("max-search-result-record-size", 5 * 1024 * 1024, 100, 10 * 1024 * 1024);
pub static MAX_SEARCH_RESULT_FIELDS_COUNT: NumberSetting =
    NumberSetting::new("max-search-result-fields-count", 500, 1, 1000);

pub static PREFILTER_THRESHOLD_RATIO: Lazy<FloatSetting> =
    Lazy::new(|| FloatSetting::new("prefilter-threshold-ratio", 0.3, 0.0, 1.0));
pub static SEARCH_RESULT_BUFFER_MULTIPLIER: Lazy<FloatSetting> =
    Lazy::new(|| FloatSetting::new("search-result-buffer-multiplier", 1.5, 1.0, 1000.0));

pub static ENABLE_PARTIAL_RESULTS: BoolSetting = BoolSetting::new(true);
pub static ENABLE_CONSISTENT_RESULTS: BoolSetting = BoolSetting::new(false);
pub static DEBUG_FORCE_TIMEOUT: BoolSetting = BoolSetting::new(false);
pub static DEBUG_FORCE_INVALID_SLOT_FINGERPRINT: BoolSetting = BoolSetting::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Warning,
    Notice,
    Verbose,
    Debug,
}

static LOG_LEVEL: AtomicU64 = AtomicU64::new(1);

pub fn log_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Warning,
        1 => LogLevel::Notice,
        2 => LogLevel::Verbose,
        _ => LogLevel::Debug,
    }
}

pub fn set_log_level(level: LogLevel) {
    let v = match level {
        LogLevel::Warning => 0,
        LogLevel::Notice => 1,
        LogLevel::Verbose => 2,
        LogLevel::Debug => 3,
    };
    LOG_LEVEL.store(v, Ordering::Relaxed);
}

// Shorthand getters for the hot paths.
pub fn timeout_poll_frequency() -> u64 {
    TIMEOUT_POLL_FREQUENCY.get()
}

pub fn debug_force_timeout() -> bool {
    DEBUG_FORCE_TIMEOUT.get()
}

pub fn max_term_expansions() -> usize {
    MAX_TERM_EXPANSIONS.get() as usize
}

pub fn prefilter_threshold_ratio() -> f64 {
    PREFILTER_THRESHOLD_RATIO.get()
}

/// Sets a numeric or boolean key by its registered name. Used by the host's
/// CONFIG SET surface; bad names and out-of-range values return `ERR`.
pub fn set_by_name(name: &str, value: &str) -> Result<()> {
    if let Some(setting) = number_registry().iter().find(|s| s.name == name) {
        let parsed: u64 = value
            .parse()
            .map_err(|_| UserError::ConfigValueOutOfRange {
                name: setting.name,
                min: setting.min.to_string(),
                max: setting.max.to_string(),
            })?;
        return setting.set(parsed);
    }
    match name {
        "prefilter-threshold-ratio" | "search-result-buffer-multiplier" => {
            let setting: &FloatSetting = if name == "prefilter-threshold-ratio" {
                &PREFILTER_THRESHOLD_RATIO
            } else {
                &SEARCH_RESULT_BUFFER_MULTIPLIER
            };
            let parsed: f64 = value.parse().map_err(|_| UserError::ConfigValueOutOfRange {
                name: setting.name,
                min: setting.min.to_string(),
                max: setting.max.to_string(),
            })?;
            setting.set(parsed)
        }
        "enable-partial-results" => {
            ENABLE_PARTIAL_RESULTS.set(parse_bool(name, value)?);
            Ok(())
        }
        "enable-consistent-results" => {
            ENABLE_CONSISTENT_RESULTS.set(parse_bool(name, value)?);
            Ok(())
        }
        "log-level" => {
            let level = match value {
                "warning" => LogLevel::Warning,
                "notice" => LogLevel::Notice,
                "verbose" => LogLevel::Verbose,
                "debug" => LogLevel::Debug,
                _ => return Err(UserError::UnknownConfigKey(format!("{name}={value}")).into()),
            };
            set_log_level(level);
            Ok(())
        }
        _ => Err(UserError::UnknownConfigKey(name.to_string()).into()),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(UserError::UnknownConfigKey(format!("{name}={value}")).into()),
    }
}

fn number_registry() -> &'static [&'static NumberSetting] {
    static REGISTRY: Lazy<Vec<&'static NumberSetting>> = Lazy::new(|| {
        vec![
            &QUERY_STRING_DEPTH,
            &QUERY_STRING_TERMS_COUNT,
            &MAX_PREFIXES,
            &MAX_TAG_FIELD_LENGTH,
            &MAX_NUMERIC_FIELD_LENGTH,
            &MAX_VECTOR_ATTRIBUTES,
            &MAX_VECTOR_DIMENSIONS,
            &MAX_VECTOR_M,
            &MAX_VECTOR_EF_CONSTRUCTION,
            &MAX_VECTOR_EF_RUNTIME,
            &DEFAULT_TIMEOUT_MS,
            &MAX_KNN,
            &MAX_TERM_EXPANSIONS,
            &READER_THREADS,
            &WRITER_THREADS,
            &UTILITY_THREADS,
            &HNSW_BLOCK_SIZE,
            &ASYNC_FANOUT_THRESHOLD,
            &CLUSTER_MAP_EXPIRATION_MS,
            &FT_INFO_TIMEOUT_MS,
            &FT_INFO_RPC_TIMEOUT_MS,
            &TIMEOUT_POLL_FREQUENCY,
            &FANOUT_DATA_UNIFORMITY_PERCENT,
            &FANOUT_UNIFORMITY_MIN_INDEX_SIZE,
            &MAX_SEARCH_RESULT_RECORD_SIZE,
            &MAX_SEARCH_RESULT_FIELDS_COUNT,
        ]
    });
    &REGISTRY
}
