//! Job system configuration, validation, and error types.

use std::error::Error;
use std::fmt;

/// Number of job slots in the default pool.
pub const DEFAULT_NUM_SLOTS: usize = 32768;

/// Configuration for [`JobSystem`](crate::system::JobSystem).
#[derive(Clone, Debug)]
pub struct SchedConfig {
    /// Number of job slots. Bounds the live jobs (including permit
    /// expansions) at any instant. Must be in `1..=32768`. Default:
    /// 32768.
    pub num_slots: usize,
    /// Number of worker threads. `None` = auto-detect
    /// (`available_parallelism − 1`, clamped to `[1, 64]`), leaving one
    /// core to the thread that calls `flush`/`wait`.
    pub worker_count: Option<usize>,
    /// Spin attempts per wait-for-ready round before reporting a
    /// timeout. Default: 4096.
    pub spin_budget: u32,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self { num_slots: DEFAULT_NUM_SLOTS, worker_count: None, spin_budget: 4096 }
    }
}

impl SchedConfig {
    /// Check the structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_slots == 0 || self.num_slots > DEFAULT_NUM_SLOTS {
            return Err(ConfigError::InvalidNumSlots { configured: self.num_slots });
        }
        if self.spin_budget == 0 {
            return Err(ConfigError::ZeroSpinBudget);
        }
        Ok(())
    }

    /// Resolve the actual worker count, applying auto-detection if
    /// `None`. Explicit values are clamped to `[1, 64]`.
    pub fn resolved_worker_count(&self) -> usize {
        match self.worker_count {
            Some(n) => n.clamp(1, 64),
            None => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(2);
                cpus.saturating_sub(1).clamp(1, 64)
            }
        }
    }
}

/// Errors detected during [`SchedConfig::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// `num_slots` is zero or exceeds the 32768-slot pool bound.
    InvalidNumSlots {
        /// The rejected value.
        configured: usize,
    },
    /// `spin_budget` is zero; waits would time out immediately.
    ZeroSpinBudget,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNumSlots { configured } => {
                write!(f, "num_slots {configured} must be in 1..={DEFAULT_NUM_SLOTS}")
            }
            Self::ZeroSpinBudget => write!(f, "spin_budget must be non-zero"),
        }
    }
}

impl Error for ConfigError {}
