//! # Plant Runtime Configuration
//!
//! Defaults and loading for the object runtime settings: retry policy,
//! mailbox sizing, termination budget and identity mode.
//!
//! ## Usage
//!
//! ```rust
//! use plant_config::RuntimeConfig;
//!
//! let config = RuntimeConfig::default();
//! assert_eq!(config.overflow_drop(), config.mailbox_capacity / 4);
//! ```

pub mod defaults;
pub mod runtime_config;

pub use runtime_config::{IdentityMode, InvalidSetting, RuntimeConfig};
