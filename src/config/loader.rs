use anyhow::{Context, Result};
use ::config::{Config, Environment, File, FileFormat};
use std::path::Path;
use tracing::{debug, info};

use super::runtime::StrategyConfig;

/// Environment variables override file values, e.g.
/// `REGIME__STABILIZER__HYSTERESIS_K=5`
pub const ENV_PREFIX: &str = "REGIME";

/// Load defaults, then the optional TOML file, then the environment.
/// The result is validated before it is returned.
pub fn load_config(path: Option<&Path>) -> Result<StrategyConfig> {
    if let Ok(env_file) = dotenvy::dotenv() {
        debug!("Loaded environment from {}", env_file.display());
    }

    let defaults = Config::try_from(&StrategyConfig::default())
        .context("Failed to serialize default configuration")?;

    let mut builder = Config::builder().add_source(defaults);

    if let Some(path) = path {
        let path_str = path
            .to_str()
            .with_context(|| format!("Config path is not valid UTF-8: {:?}", path))?;
        builder = builder.add_source(File::new(path_str, FileFormat::Toml).required(true));
        info!("Loading configuration from {}", path.display());
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let config: StrategyConfig = builder
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Failed to parse configuration")?;

    let config = config.validated()?;
    Ok(config)
}

pub fn render_config(config: &StrategyConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to render configuration as TOML")
}
