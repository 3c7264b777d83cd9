/// Application-level constants
pub const APP_NAME: &str = "verigen";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix for environment variables that override `PipelineConfig` fields.
pub const ENV_PREFIX: &str = "VERIGEN_";

/// Environment variable naming a JSON config file to load.
pub const CONFIG_PATH_ENV: &str = "VERIGEN_CONFIG";

/// Log filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "verigen=info,warn"
}

/// Full name of an override variable, e.g. `env_key("GENERATION_MODEL")`.
pub fn env_key(suffix: &str) -> String {
    format!("{ENV_PREFIX}{suffix}")
}
