//! Configuration loading, validation and env substitution.
//!
//! Config files: `conveyor.toml`, `conveyor.yaml` or `conveyor.json`,
//! searched in `./` then `~/.config/conveyor/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-fallback}` substitution.

pub mod duration;
pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    duration::parse_duration,
    error::{Error, Result},
    loader::{config_dir, discover_and_load, load_config},
    schema::{
        ConveyorConfig, EndpointConfig, MetricsConfig, PipelineConfig, RecoverabilityConfig,
        RoutingConfig, SubscriptionModeConfig,
    },
    validate::{
        Diagnostic, Severity, ValidationResult, validate, validate_config, validate_str,
    },
};
