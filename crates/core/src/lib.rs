pub mod config;

pub use config::{AppConfig, ConfigError, LoadOptions, TransportMode};
