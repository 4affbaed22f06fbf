//! Configuration loading.
//!
//! Values are read, in increasing priority, from:
//! - the closest `scene-build.toml` found walking up from a directory,
//! - the file named by the `LGN_SCENE_BUILD_CONFIG` environment variable,
//! - `LGN_SCENE_BUILD_` prefixed environment variables.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::value::magic::RelativePathBuf;
use figment::Figment;

use crate::Result;

/// The default filename for configuration files.
pub static DEFAULT_FILENAME: &str = "scene-build.toml";

/// Environment variable naming an additional configuration file.
pub static CONFIG_FILE_ENV: &str = "LGN_SCENE_BUILD_CONFIG";

/// Prefix of environment variables overriding configuration values.
pub static ENV_PREFIX: &str = "LGN_SCENE_BUILD_";

#[derive(Debug, Clone, Default)]
pub struct Config {
    figment: Figment,
}

impl Config {
    /// Create a configuration from a TOML string.
    ///
    /// Useful for tests mostly.
    pub fn from_toml(toml: &str) -> Self {
        let figment = Figment::new().merge(Toml::string(toml));
        Self { figment }
    }

    /// Load the configuration from the current directory.
    pub fn load() -> Result<Self> {
        Self::load_with_current_directory(std::env::current_dir()?)
    }

    /// Load the configuration, looking for a configuration file in `path` and
    /// its ancestors.
    pub fn load_with_current_directory(path: impl AsRef<Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Stop at the closest configuration file.
        for dir in path.as_ref().ancestors() {
            let config_file_path = dir.join(DEFAULT_FILENAME);

            if std::fs::metadata(&config_file_path).is_ok() {
                figment = figment.merge(Toml::file(config_file_path));
                break;
            }
        }

        if let Some(config_file_path) = std::env::var_os(CONFIG_FILE_ENV) {
            figment = figment.merge(Toml::file(config_file_path));
        }

        // `CONFIG` would be picked up as a key otherwise.
        let figment = figment.merge(
            Env::prefixed(ENV_PREFIX)
                .ignore(&["CONFIG"])
                .split("__"),
        );

        Ok(Self { figment })
    }

    /// Override this configuration with another one.
    pub fn override_with(&mut self, other: Self) {
        let figment = std::mem::take(&mut self.figment);
        self.figment = figment.merge(other.figment);
    }

    /// Get the value specified by the key.
    ///
    /// If the value does not exist, None is returned.
    pub fn get<'de, T>(&self, key: &str) -> Result<Option<T>>
    where
        T: serde::Deserialize<'de>,
    {
        match self.figment.extract_inner(key) {
            Ok(value) => Ok(Some(value)),
            Err(err) => match &err.kind {
                figment::error::Kind::MissingField(missing_key) => {
                    if key == missing_key {
                        Ok(None)
                    } else {
                        Err(Box::new(err).into())
                    }
                }
                _ => Err(Box::new(err).into()),
            },
        }
    }

    /// Get the value specified by the key or a specified default value if it is
    /// not found.
    pub fn get_or<'de, T>(&self, key: &str, default: T) -> Result<T>
    where
        T: serde::Deserialize<'de>,
    {
        self.get(key).map(|value| value.unwrap_or(default))
    }

    /// Get the absolute path at the specified key.
    ///
    /// A relative path is resolved relative to its containing configuration
    /// file, or the current working directory if the value does not come from
    /// a file.
    pub fn get_absolute_path(&self, key: &str) -> Result<Option<PathBuf>> {
        if let Some(path) = self.get::<RelativePathBuf>(key)? {
            let path = path.relative();

            Ok(Some(if path.is_absolute() {
                path
            } else {
                std::env::current_dir()?.join(path)
            }))
        } else {
            Ok(None)
        }
    }
}
