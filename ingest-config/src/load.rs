//! Layered configuration loading.
//!
//! Sources apply in order, each overriding the ones before it:
//! 1. `<dir>/base.{yaml,yml,json}`
//! 2. `<dir>/<environment>.{yaml,yml,json}`, where the environment comes from `APP_ENVIRONMENT`
//! 3. `APP_`-prefixed environment variables, with `__` between nested keys
//!    (`APP_POOL__MAX_CONNECTIONS=50`)

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory holding the configuration files, relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

const ENV_PREFIX: &str = "APP";

/// Implemented by top-level configuration structures.
pub trait Config {
    /// Keys whose environment variable values are comma-separated lists
    /// (`APP_CHANNELS=asset_changes,site_changes`).
    const LIST_PARSE_KEYS: &'static [&'static str];
}

#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingDirectory(PathBuf),

    #[error(
        "no `{stem}` configuration file in `{directory}` (tried {extensions})",
        extensions = EXTENSIONS.join(", ")
    )]
    MissingFile { stem: String, directory: PathBuf },

    #[error("invalid configuration file `{path}`: {source}")]
    InvalidFile {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },

    #[error("invalid configuration: {0}")]
    Invalid(#[source] config::ConfigError),
}

/// Loads `T` from `./configuration` for the environment named by `APP_ENVIRONMENT`.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let directory = std::env::current_dir()
        .map_err(LoadConfigError::CurrentDir)?
        .join(CONFIGURATION_DIR);
    let environment = Environment::load().map_err(LoadConfigError::Environment)?;

    load_config_from_dir(&directory, environment)
}

/// Loads `T` from an explicit directory and environment.
pub fn load_config_from_dir<T>(
    directory: &Path,
    environment: Environment,
) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingDirectory(directory.to_path_buf()));
    }

    let mut builder = config::Config::builder();
    for stem in ["base".to_string(), environment.to_string()] {
        let path = locate(directory, &stem)?;
        builder = builder.add_source(config::File::from(path.clone()));
        // Building after every file pins a syntax error on the file that introduced it.
        if let Err(source) = builder.clone().build() {
            return Err(LoadConfigError::InvalidFile { path, source });
        }
    }

    builder
        .add_source(variables::<T>())
        .build()
        .and_then(|settings| settings.try_deserialize::<T>())
        .map_err(LoadConfigError::Invalid)
}

fn variables<T: Config>() -> config::Environment {
    let source = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__");
    if T::LIST_PARSE_KEYS.is_empty() {
        return source;
    }

    T::LIST_PARSE_KEYS.iter().fold(
        source.try_parsing(true).list_separator(","),
        |source, key| source.with_list_parse_key(key),
    )
}

fn locate(directory: &Path, stem: &str) -> Result<PathBuf, LoadConfigError> {
    EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .find(|path| path.is_file())
        .ok_or_else(|| LoadConfigError::MissingFile {
            stem: stem.to_string(),
            directory: directory.to_path_buf(),
        })
}
