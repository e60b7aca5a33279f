//! Application configuration module.
//!
//! Reads the TOML file that holds the content API endpoint and the
//! scheduler, polling and timer settings.

#[allow(clippy::module_inception)]
mod config;
mod paths;

#[allow(clippy::module_name_repetitions)]
pub use config::AppConfig;
pub use paths::resolve_config_path;
