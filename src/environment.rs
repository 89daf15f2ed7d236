//! Service environment resolution.
//!
//! A service reads its variables from one or more dotenv-style files. Files
//! are merged in the order configured; a later file overwrites keys of an
//! earlier one. Reading problems never fail resolution: a missing file
//! contributes nothing and a file that fails to parse keeps contributing the
//! values it had the last time it parsed.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::EnvironmentSourceError;

/// Flat variable mapping. Keys are case-sensitive.
pub type Environment = HashMap<String, String>;

/// Reads key/value pairs from an environment file.
pub trait EnvironmentSource: Send + Sync {
    /// Reads every pair in `path`.
    ///
    /// # Errors
    ///
    /// [`EnvironmentSourceError::NotFound`] if the file does not exist,
    /// [`EnvironmentSourceError::Parse`] for any other failure.
    fn read(&self, path: &Path) -> Result<Environment, EnvironmentSourceError>;
}

/// `.env` file reader backed by dotenvy.
#[derive(Debug, Default, Clone, Copy)]
pub struct DotenvSource;

impl EnvironmentSource for DotenvSource {
    fn read(&self, path: &Path) -> Result<Environment, EnvironmentSourceError> {
        let parse_err = |e: dotenvy::Error| {
            if e.not_found() {
                EnvironmentSourceError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                EnvironmentSourceError::Parse {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                }
            }
        };

        let mut env = Environment::new();
        for item in dotenvy::from_path_iter(path).map_err(parse_err)? {
            let (key, value) = item.map_err(parse_err)?;
            env.insert(key, value);
        }
        Ok(env)
    }
}

/// Merges a service's environment files into one [`Environment`].
#[derive(Debug, Clone, Default)]
pub struct EnvironmentResolver {
    files: Vec<PathBuf>,
    last_good: HashMap<PathBuf, Environment>,
}

impl EnvironmentResolver {
    /// Creates a resolver over `files`, merged in order.
    #[must_use]
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            last_good: HashMap::new(),
        }
    }

    /// Returns true if `path` is one of the configured files.
    #[must_use]
    pub fn depends_on(&self, path: &Path) -> bool {
        self.files.iter().any(|f| f == path)
    }

    /// Reads every configured file and returns the merged environment.
    pub fn resolve(&mut self, service: &str, source: &dyn EnvironmentSource) -> Environment {
        let mut env = Environment::new();

        for file in &self.files {
            info!(service, file = %file.display(), "Loading environment variables");

            let values = match source.read(file) {
                Ok(values) => {
                    self.last_good.insert(file.clone(), values.clone());
                    values
                }
                Err(err @ EnvironmentSourceError::NotFound { .. }) => {
                    warn!(service, error = %err, "Environment file skipped");
                    self.last_good.remove(file);
                    continue;
                }
                Err(err) => {
                    warn!(service, error = %err, "Keeping previous values of environment file");
                    match self.last_good.get(file) {
                        Some(previous) => previous.clone(),
                        None => continue,
                    }
                }
            };

            for (key, value) in values {
                debug!(service, file = %file.display(), key = %key, "Environment variable loaded");
                env.insert(key, value);
            }
        }

        env
    }
}

/// Creates an empty file at `path` if nothing exists there yet.
///
/// Returns true if the file was created.
///
/// # Errors
///
/// Returns the I/O error if the file could not be created.
pub fn create_if_missing(path: &Path) -> io::Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}
