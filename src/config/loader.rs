//! Configuration Loader
//!
//! Builds an [`AppConfig`] from compiled defaults, an optional file and
//! `PAPA_EVENTS_*` environment variables using the `config` crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use tracing::{debug, info};

use super::AppConfig;
use crate::error::PapaResult;

pub const ENV_PREFIX: &str = "PAPA_EVENTS";

#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    /// Replaces the process environment when set
    env_source: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer a config file over the defaults. Format follows the extension.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env_source(mut self, vars: HashMap<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    pub fn load(self) -> PapaResult<AppConfig> {
        let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

        if let Some(path) = &self.file {
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(self.env_source.clone());
        builder = builder.add_source(environment);

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        info!(
            broker = %redact_uri(&config.broker_uri),
            failover = config.failover_uri.is_some(),
            max_jobs = config.max_jobs,
            retries = config.retries,
            exchange = %config.exchange,
            "⚙️ Configuration loaded"
        );
        Ok(config)
    }
}

/// Mask credentials in a connection URI before it reaches the logs
pub fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &uri[..scheme_end + 3], &uri[at..])
        }
        _ => uri.to_string(),
    }
}
