//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → AdmissionConfig (validated, immutable)
//!     → handed to reactor, acceptor, TLS context at startup
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, resolve_config, ConfigError, Overrides};
pub use schema::AdmissionConfig;
pub use schema::DetectionConfig;
pub use schema::HandshakeConfig;
pub use schema::ListenerConfig;
pub use schema::LogFormat;
pub use schema::ObservabilityConfig;
pub use schema::ReactorConfig;
pub use schema::ResolverConfig;
pub use schema::TlsConfig;
pub use validation::{validate_config, ValidationError};
