//! Engine configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env`)
//! 3. User's `DPW_CONFIG_RS` file (compile-time)
//! 4. Library defaults
//!
//! ```rust,ignore
//! use dpworker_runtime::config::EngineConfig;
//!
//! let config = EngineConfig::from_env()
//!     .num_workers(4)
//!     .time_slice(Duration::from_micros(20));
//! config.validate()?;
//! ```

pub mod defaults;

use std::fmt;
use std::time::Duration;

use dpworker_core::env::{env_get, env_get_bool};
use dpworker_core::wire::RECORD_SIZE;
use dpworker_net::frame::HEADERS_LEN;

use crate::preempt::PreemptionKind;

/// Smallest stack a job may run on; signal frames land on it too
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Upper bound on workers per process
pub const MAX_WORKERS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Worker cores, one engine each
    pub num_workers: usize,
    /// Stack bytes per job
    pub stack_size: usize,
    /// Job slots (running + suspended) per worker
    pub max_jobs: usize,
    /// Reply buffers per worker
    pub response_pool_slots: usize,
    pub response_slot_size: usize,
    /// Shared receive buffers
    pub rx_pool_slots: usize,
    pub rx_slot_size: usize,
    /// Run time after which the dispatcher preempts a job; zero disables
    pub time_slice: Duration,
    pub preemption: PreemptionKind,
    /// Pin worker i to core `first_core + i`
    pub pin_workers: bool,
    pub first_core: usize,
    /// Bound of the dispatcher's inbound queue
    pub ingress_capacity: usize,
    pub debug_logging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_preemption() -> PreemptionKind {
    defaults::PREEMPTION.parse().unwrap_or(PreemptionKind::Signal)
}

impl EngineConfig {
    /// Compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `DPW_NUM_WORKERS`
    /// - `DPW_STACK_SIZE`
    /// - `DPW_MAX_JOBS`
    /// - `DPW_RESPONSE_POOL_SLOTS`, `DPW_RESPONSE_SLOT_SIZE`
    /// - `DPW_RX_POOL_SLOTS`, `DPW_RX_SLOT_SIZE`
    /// - `DPW_TIME_SLICE_US` - 0 disables slice preemption
    /// - `DPW_PREEMPTION` - signal | cooperative
    /// - `DPW_PIN_WORKERS`, `DPW_FIRST_CORE`
    /// - `DPW_INGRESS_CAPACITY`
    /// - `DPW_DEBUG`
    pub fn from_env() -> Self {
        Self {
            num_workers: env_get("DPW_NUM_WORKERS", defaults::NUM_WORKERS),
            stack_size: env_get("DPW_STACK_SIZE", defaults::STACK_SIZE),
            max_jobs: env_get("DPW_MAX_JOBS", defaults::MAX_JOBS),
            response_pool_slots: env_get("DPW_RESPONSE_POOL_SLOTS", defaults::RESPONSE_POOL_SLOTS),
            response_slot_size: env_get("DPW_RESPONSE_SLOT_SIZE", defaults::RESPONSE_SLOT_SIZE),
            rx_pool_slots: env_get("DPW_RX_POOL_SLOTS", defaults::RX_POOL_SLOTS),
            rx_slot_size: env_get("DPW_RX_SLOT_SIZE", defaults::RX_SLOT_SIZE),
            time_slice: Duration::from_micros(env_get("DPW_TIME_SLICE_US", defaults::TIME_SLICE_US)),
            preemption: env_get("DPW_PREEMPTION", default_preemption()),
            pin_workers: env_get_bool("DPW_PIN_WORKERS", defaults::PIN_WORKERS),
            first_core: env_get("DPW_FIRST_CORE", defaults::FIRST_CORE),
            ingress_capacity: env_get("DPW_INGRESS_CAPACITY", defaults::INGRESS_CAPACITY),
            debug_logging: env_get_bool("DPW_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    /// Compile-time defaults only (no env override).
    pub fn new() -> Self {
        Self {
            num_workers: defaults::NUM_WORKERS,
            stack_size: defaults::STACK_SIZE,
            max_jobs: defaults::MAX_JOBS,
            response_pool_slots: defaults::RESPONSE_POOL_SLOTS,
            response_slot_size: defaults::RESPONSE_SLOT_SIZE,
            rx_pool_slots: defaults::RX_POOL_SLOTS,
            rx_slot_size: defaults::RX_SLOT_SIZE,
            time_slice: Duration::from_micros(defaults::TIME_SLICE_US),
            preemption: default_preemption(),
            pin_workers: defaults::PIN_WORKERS,
            first_core: defaults::FIRST_CORE,
            ingress_capacity: defaults::INGRESS_CAPACITY,
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn max_jobs(mut self, n: usize) -> Self {
        self.max_jobs = n;
        self
    }

    pub fn response_pool(mut self, slots: usize, slot_size: usize) -> Self {
        self.response_pool_slots = slots;
        self.response_slot_size = slot_size;
        self
    }

    pub fn rx_pool(mut self, slots: usize, slot_size: usize) -> Self {
        self.rx_pool_slots = slots;
        self.rx_slot_size = slot_size;
        self
    }

    pub fn time_slice(mut self, d: Duration) -> Self {
        self.time_slice = d;
        self
    }

    pub fn preemption(mut self, kind: PreemptionKind) -> Self {
        self.preemption = kind;
        self
    }

    pub fn pin_workers(mut self, first_core: Option<usize>) -> Self {
        self.pin_workers = first_core.is_some();
        if let Some(core) = first_core {
            self.first_core = core;
        }
        self
    }

    pub fn ingress_capacity(mut self, cap: usize) -> Self {
        self.ingress_capacity = cap;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Slice in nanoseconds, 0 when disabled
    pub fn time_slice_ns(&self) -> u64 {
        self.time_slice.as_nanos().min(u64::MAX as u128) as u64
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 64KB"));
        }
        if self.max_jobs == 0 || self.max_jobs > u32::MAX as usize {
            return Err(ConfigError::InvalidValue("max_jobs must be in 1..=u32::MAX"));
        }
        if self.response_pool_slots == 0 {
            return Err(ConfigError::InvalidValue("response_pool_slots must be > 0"));
        }
        if self.response_slot_size < RECORD_SIZE {
            return Err(ConfigError::InvalidValue("response_slot_size must hold one wire record"));
        }
        if self.rx_pool_slots == 0 {
            return Err(ConfigError::InvalidValue("rx_pool_slots must be > 0"));
        }
        if self.rx_slot_size < HEADERS_LEN + RECORD_SIZE {
            return Err(ConfigError::InvalidValue("rx_slot_size must hold headers plus one wire record"));
        }
        if self.ingress_capacity == 0 {
            return Err(ConfigError::InvalidValue("ingress_capacity must be > 0"));
        }
        Ok(())
    }

    /// Log the configuration at info level
    pub fn print(&self) {
        log::info!("dpworker configuration:");
        log::info!("  num_workers:          {}", self.num_workers);
        log::info!("  stack_size:           {}", self.stack_size);
        log::info!("  max_jobs:             {}", self.max_jobs);
        log::info!("  response_pool:        {} x {}", self.response_pool_slots, self.response_slot_size);
        log::info!("  rx_pool:              {} x {}", self.rx_pool_slots, self.rx_slot_size);
        log::info!("  time_slice:           {:?}", self.time_slice);
        log::info!("  preemption:           {}", self.preemption);
        log::info!("  pin_workers:          {} (first core {})", self.pin_workers, self.first_core);
        log::info!("  ingress_capacity:     {}", self.ingress_capacity);
        log::info!("  debug_logging:        {}", self.debug_logging);
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = EngineConfig::new();
        assert!(config.num_workers >= 1);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_from_env_override() {
        std::env::set_var("DPW_MAX_JOBS", "77");
        std::env::set_var("DPW_PREEMPTION", "cooperative");
        let config = EngineConfig::from_env();
        std::env::remove_var("DPW_MAX_JOBS");
        std::env::remove_var("DPW_PREEMPTION");

        assert_eq!(config.max_jobs, 77);
        assert_eq!(config.preemption, PreemptionKind::Cooperative);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .num_workers(8)
            .time_slice(Duration::from_micros(5))
            .preemption(PreemptionKind::Cooperative)
            .pin_workers(Some(4));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.time_slice_ns(), 5_000);
        assert_eq!(config.preemption, PreemptionKind::Cooperative);
        assert!(config.pin_workers);
        assert_eq!(config.first_core, 4);
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::new().num_workers(0).validate().is_err());
        assert!(EngineConfig::new().num_workers(1000).validate().is_err());
        assert!(EngineConfig::new().stack_size(4096).validate().is_err());
        assert!(EngineConfig::new().response_pool(16, 8).validate().is_err());
        assert!(EngineConfig::new().rx_pool(0, 2048).validate().is_err());
        assert!(EngineConfig::new().time_slice(Duration::ZERO).validate().is_ok());
    }
}
