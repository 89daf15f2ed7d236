//! Error types for hookrelay.
//!
//! All errors in hookrelay are strongly typed using thiserror.
//! Resolution errors (templates, environment files) are recovered locally by
//! the service lifecycle; transport and hook errors are logged by their callers.

use std::path::PathBuf;

use thiserror::Error;

use crate::hook::HookKind;

fn requirement(optional: &bool) -> &'static str {
    if *optional {
        "optional"
    } else {
        "required"
    }
}

/// Errors produced while expanding a topic template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// A placeholder has no value in the environment.
    #[error("No value for {} variable '{name}'", requirement(.optional))]
    MissingVariable {
        /// Variable name.
        name: String,
        /// Whether the placeholder carried the `?` marker.
        optional: bool,
    },

    /// Two array variables split into different lengths.
    #[error("Array size differs: {name} ({actual} should be {expected})")]
    ArityMismatch {
        /// The variable whose length disagrees.
        name: String,
        /// Its split length.
        actual: usize,
        /// Length established by the first array variable.
        expected: usize,
    },
}

impl TemplateError {
    /// Returns true if expansion failed on an optional placeholder.
    #[must_use]
    pub const fn is_optional(&self) -> bool {
        matches!(self, Self::MissingVariable { optional: true, .. })
    }

    /// Name of the variable that caused the failure.
    #[must_use]
    pub fn variable(&self) -> &str {
        match self {
            Self::MissingVariable { name, .. } | Self::ArityMismatch { name, .. } => name,
        }
    }
}

/// Errors reading a service manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors reading an environment source.
#[derive(Debug, Error)]
pub enum EnvironmentSourceError {
    #[error("Environment file does not exist: {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to parse environment file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

impl EnvironmentSourceError {
    /// Returns true if the source file is missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors spawning a hook process.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("[{service}] failed to execute {hook}: {source}")]
    Spawn {
        service: String,
        hook: HookKind,
        #[source]
        source: std::io::Error,
    },
}

/// Errors reported by the message transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Failed to subscribe to '{topic}': {message}")]
    Subscribe { topic: String, message: String },

    #[error("Failed to unsubscribe from '{topic}': {message}")]
    Unsubscribe { topic: String, message: String },

    #[error("Failed to start transport: {message}")]
    Start { message: String },

    #[error("Transport closed")]
    Closed,
}

/// A malformed `scheme://address` string given to the broker or API flags.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid address '{address}': {reason}")]
pub struct AddressError {
    pub address: String,
    pub reason: &'static str,
}

/// Errors of the service registry (surrounding layer).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Services directory {path} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("Failed to scan services directory {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Services from {path} are already loaded")]
    AlreadyLoaded { path: PathBuf },

    #[error("Failed to start file watcher: {message}")]
    Watcher { message: String },
}

/// Top-level error type for hookrelay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentSourceError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl RelayError {
    /// Returns true if this is a template error.
    #[must_use]
    pub const fn is_template(&self) -> bool {
        matches!(self, Self::Template(_))
    }

    /// Returns true if this is a manifest error.
    #[must_use]
    pub const fn is_manifest(&self) -> bool {
        matches!(self, Self::Manifest(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if the surrounding process cannot continue.
    ///
    /// Everything below the registry is recoverable.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Registry(_))
    }
}

/// Result type alias for hookrelay operations.
pub type RelayResult<T> = Result<T, RelayError>;
