//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → consumed as plain structs by each subsystem
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → backend set reconciled against the registry
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only the backend set is reloadable
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AdminConfig, Algorithm, BackendConfig, CacheConfig, CircuitBreakerConfig,
    HealthCheckConfig, ListenerConfig, LoadBalancerConfig, LogFormat, ObservabilityConfig,
    PoolConfig, ProxyConfig, RetryConfig, TimeoutConfig,
};
