//! Runtime defaults
//!
//! Values used when neither the configuration file nor the environment
//! provides a setting.

/// Registration / reference creation retry
pub mod retry {
    /// Attempts per operation (always at least one)
    pub const REPEAT_COUNT: u32 = 2;

    /// Pause between attempts (milliseconds)
    pub const REPEAT_TIMEOUT_MS: u64 = 100;
}

/// Mailbox sizing
pub mod mailbox {
    /// Per-priority queue capacity
    pub const CAPACITY: usize = 1000;

    /// Fraction of the capacity dropped when compaction is not enough
    pub const OVERFLOW_DROP_DIVISOR: usize = 4;

    /// Messages dropped on overflow for a given capacity, never zero
    pub const fn overflow_drop(capacity: usize) -> usize {
        let n = capacity / OVERFLOW_DROP_DIVISOR;
        if n == 0 {
            1
        } else {
            n
        }
    }
}

/// Process termination
pub mod termination {
    /// Watchdog budget for graceful shutdown (milliseconds)
    pub const TERMINATE_TIMEOUT_MS: u64 = 2_000;
}

/// Timers ordered by objects
pub mod timers {
    /// Shortest interval a timer can be ordered with (milliseconds)
    pub const MIN_QUANTUM_MS: u64 = 10;
}

pub const NODE_ID: i64 = 0;
pub const LOG_LEVEL: &str = "info";

/// Environment variable prefix (`PLANT_MAILBOX_CAPACITY=...`)
pub const ENV_PREFIX: &str = "PLANT";
