pub mod loader;

pub use loader::{load_config, validate_config, CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH};
