//! # hookrelay - Topic-driven hook runner
//!
//! hookrelay subscribes to pub/sub topics on behalf of operator-defined
//! services and runs a shell hook for every message that arrives. Topics are
//! templates expanded against per-service environment files; when a file
//! changes, the affected services re-expand their topics and move their
//! subscriptions.
//!
//! ## Core Concepts
//!
//! - **Template**: A topic pattern with `{VAR}`, `{VAR[]}` and `{VAR}?` placeholders
//! - **Service**: A manifest plus its resolved environment, topics and enabled flag
//! - **Broker**: Fans one transport subscription out to many subscribers
//! - **Hook**: A shell command receiving the payload on stdin and `TOPIC` in its environment
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hookrelay::{MemoryTransport, Registry, RelayConfig};
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let registry = Registry::new(RelayConfig::with_services_dir("/etc/hookrelay.d"), transport.clone());
//! registry.load_services()?;
//!
//! // Runs the OnReceive hook of every service subscribed to this topic.
//! transport.publish("home/kitchen/light/set", b"on");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Topic templates
pub mod environment;
pub mod error;
pub mod template;
pub mod topics;

// Messaging
pub mod broker;
pub mod hook;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod transport;

// Services
pub mod config;
pub mod manifest;
pub mod registry;
pub mod service;
pub mod watcher;

// Reflection
#[cfg(feature = "api")]
pub mod api;

// Re-export primary types at crate root for convenience
pub use broker::{Broker, Subscriber};
pub use config::RelayConfig;
pub use environment::{DotenvSource, Environment, EnvironmentResolver, EnvironmentSource};
pub use error::{
    AddressError, EnvironmentSourceError, HookError, ManifestError, RegistryError, RelayError, RelayResult,
    TemplateError, TransportError,
};
pub use hook::{HookInvoker, HookKind, HookRequest, ShellInvoker};
pub use manifest::{Manifest, ManifestHooks};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttAddress, MqttConfig, MqttTransport};
pub use registry::Registry;
pub use service::{Service, ServiceSnapshot, ServiceStatus};
pub use template::{expand, Template, TemplateVariable};
pub use topics::{SkippedTemplate, TopicResolution};
pub use transport::{topic_matches, MemoryTransport, MessageHandler, Transport};
pub use watcher::EnvironmentWatcher;
