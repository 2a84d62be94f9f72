mod settings;

use std::path::Path;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BackendKind, BindingSettings, BrokerSettings, LogSettings, QueueSettings, Settings,
    TopologySettings,
};

/// Prefix for environment overrides, e.g. `BUNNYHOP__BROKER__URL`.
pub const ENV_PREFIX: &str = "BUNNYHOP";

/// Loads the configuration from `config/default` and environment variables,
/// merged over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] with an explicit base file (extension optional).
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::from(path.as_ref()).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    Ok(Settings {
        backend: partial.backend.unwrap_or(default.backend),
        broker: BrokerSettings {
            url: partial
                .broker
                .as_ref()
                .and_then(|b| b.url.clone())
                .unwrap_or(default.broker.url),
            prefetch: partial
                .broker
                .as_ref()
                .and_then(|b| b.prefetch)
                .unwrap_or(default.broker.prefetch),
            max_reconnect_attempts: partial
                .broker
                .as_ref()
                .and_then(|b| b.max_reconnect_attempts)
                .unwrap_or(default.broker.max_reconnect_attempts),
            reconnect_delay_ms: partial
                .broker
                .as_ref()
                .and_then(|b| b.reconnect_delay_ms)
                .unwrap_or(default.broker.reconnect_delay_ms),
        },
        topology: partial.topology.unwrap_or(default.topology),
        log: LogSettings {
            level: partial
                .log
                .and_then(|l| l.level)
                .unwrap_or(default.log.level),
        },
    })
}

#[cfg(test)]
mod tests;
