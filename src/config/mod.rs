//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → pieces handed to pool, replica sets, dispatcher, workers
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; endpoints never change at runtime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::AdminConfig;
pub use schema::CircuitBreakerConfig;
pub use schema::DispatchConfig;
pub use schema::GatewayConfig;
pub use schema::HealthCheckConfig;
pub use schema::LogFormat;
pub use schema::ObservabilityConfig;
pub use schema::PoolConfig;
pub use schema::ServiceConfig;
pub use schema::Strategy;
