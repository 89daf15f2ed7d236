//! Service lifecycle.
//!
//! A [`Service`] binds a manifest to its resolved environment, its concrete
//! topics and its enabled flag:
//!
//! ```text
//!  Loaded ──resolve──► Enabled ◄──┐
//!     │                  │        │ environment file changed
//!     └──resolve──► Disabled ─────┘ (re-enable, resolve again)
//! ```
//!
//! Every transition runs with the service state locked, so two reloads of the
//! same service never interleave and dispatch always reads a consistent
//! environment. The lock is taken before the broker's.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::{Broker, Subscriber};
use crate::environment::{Environment, EnvironmentResolver, EnvironmentSource};
use crate::error::{HookError, RelayResult};
use crate::hook::{HookInvoker, HookKind, HookRequest};
use crate::manifest::Manifest;
use crate::topics::{self, TopicResolution};

/// Coarse lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Manifest parsed, topics never resolved.
    Loaded,
    /// Topics resolved; subscribed (or about to be).
    Enabled,
    /// A required variable is missing; nothing subscribed.
    Disabled,
}

/// The `Hooks` part of a [`ServiceSnapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HooksSnapshot {
    /// `OnReceive` command line, empty when unset.
    pub on_receive: String,
}

/// Read-only view of a service for listing and inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceSnapshot {
    /// Service name (manifest file name).
    pub name: String,
    /// Manifest description.
    pub description: String,
    /// Whether the service is subscribed.
    pub enabled: bool,
    /// Concrete topics.
    pub topics: Vec<String>,
    /// Hook command lines.
    pub hooks: HooksSnapshot,
    /// When topics were last resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct ServiceState {
    resolver: EnvironmentResolver,
    environment: Environment,
    topics: Vec<String>,
    /// Current topics are registered with the broker.
    subscribed: bool,
    enabled: bool,
    resolved_at: Option<DateTime<Utc>>,
}

/// One operator-defined service.
pub struct Service {
    name: String,
    manifest: Manifest,
    invoker: Arc<dyn HookInvoker>,
    state: Mutex<ServiceState>,
}

impl Service {
    /// Creates a service in the `Loaded` state. Services start enabled; only
    /// a failed resolution disables them.
    #[must_use]
    pub fn new(name: impl Into<String>, manifest: Manifest, invoker: Arc<dyn HookInvoker>) -> Arc<Self> {
        let resolver = EnvironmentResolver::new(manifest.environment_files.clone());
        Arc::new(Self {
            name: name.into(),
            manifest,
            invoker,
            state: Mutex::new(ServiceState {
                resolver,
                environment: Environment::new(),
                topics: Vec::new(),
                subscribed: false,
                enabled: true,
                resolved_at: None,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn as_subscriber(self: &Arc<Self>) -> Arc<dyn Subscriber> {
        Arc::clone(self) as Arc<dyn Subscriber>
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The manifest this service was built from.
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Returns true if `file` is one of this service's environment files.
    #[must_use]
    pub fn depends_on(&self, file: &Path) -> bool {
        self.state().resolver.depends_on(file)
    }

    /// Whether the service may subscribe.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        let state = self.state();
        match (state.resolved_at, state.enabled) {
            (None, _) => ServiceStatus::Loaded,
            (Some(_), true) => ServiceStatus::Enabled,
            (Some(_), false) => ServiceStatus::Disabled,
        }
    }

    /// Concrete topics from the last resolution.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.state().topics.clone()
    }

    /// Copy of the resolved environment.
    #[must_use]
    pub fn environment(&self) -> Environment {
        self.state().environment.clone()
    }

    /// Sets the enabled flag without resolving anything.
    pub fn set_enabled(&self, enabled: bool) {
        self.state().enabled = enabled;
    }

    /// Re-reads every environment file into the service environment.
    pub fn load_environment(&self, source: &dyn EnvironmentSource) {
        let mut state = self.state();
        self.load_environment_locked(&mut state, source);
    }

    /// Releases every current topic, then recomputes the topic list from the
    /// manifest. A required-variable failure disables the service and leaves
    /// it without topics. Does not subscribe.
    pub fn expand_topics(self: &Arc<Self>, broker: &Broker) {
        let mut state = self.state();
        self.expand_topics_locked(&mut state, broker);
    }

    /// Subscribes every resolved topic, if enabled. Topics already
    /// subscribed since the last expansion are not registered again.
    pub fn subscribe(self: &Arc<Self>, broker: &Broker) {
        let mut state = self.state();
        self.subscribe_locked(&mut state, broker);
    }

    /// Initial load: environment and topics, no subscription.
    pub fn initialize(self: &Arc<Self>, source: &dyn EnvironmentSource, broker: &Broker) {
        let mut state = self.state();
        self.load_environment_locked(&mut state, source);
        self.expand_topics_locked(&mut state, broker);
    }

    /// Reaction to a change of one of the environment files: re-enable,
    /// reload, re-expand and resubscribe as one step.
    pub fn reload(self: &Arc<Self>, source: &dyn EnvironmentSource, broker: &Broker) {
        let mut state = self.state();
        state.enabled = true;
        self.load_environment_locked(&mut state, source);
        self.expand_topics_locked(&mut state, broker);
        self.subscribe_locked(&mut state, broker);
    }

    /// Read-only view for listing.
    #[must_use]
    pub fn snapshot(&self) -> ServiceSnapshot {
        let state = self.state();
        ServiceSnapshot {
            name: self.name.clone(),
            description: self.manifest.description.clone(),
            enabled: state.enabled,
            topics: state.topics.clone(),
            hooks: HooksSnapshot {
                on_receive: self.manifest.hooks.on_receive.clone().unwrap_or_default(),
            },
            resolved_at: state.resolved_at,
        }
    }

    fn load_environment_locked(&self, state: &mut ServiceState, source: &dyn EnvironmentSource) {
        state.environment = state.resolver.resolve(&self.name, source);
    }

    fn expand_topics_locked(self: &Arc<Self>, state: &mut ServiceState, broker: &Broker) {
        let me = self.as_subscriber();
        for topic in &state.topics {
            debug!(service = %self.name, topic = %topic, "Releasing topic");
            // Failures are logged by the broker; local bookkeeping already moved on.
            let _ = broker.unsubscribe(topic, &me);
        }
        state.topics.clear();
        state.subscribed = false;

        let resolution = topics::resolve(self.manifest.topics.iter().map(String::as_str), &state.environment);
        state.resolved_at = Some(Utc::now());

        match resolution {
            TopicResolution::Resolved { topics, skipped } => {
                for skip in &skipped {
                    info!(
                        service = %self.name,
                        template = %skip.template,
                        reason = %skip.error,
                        "Skipping topic with optional variable"
                    );
                }
                state.topics = topics;
            }
            TopicResolution::Disabled(cause) => {
                warn!(
                    service = %self.name,
                    template = %cause.template,
                    reason = %cause.error,
                    "Failed to expand topic; service disabled"
                );
                state.enabled = false;
            }
        }
    }

    fn subscribe_locked(self: &Arc<Self>, state: &mut ServiceState, broker: &Broker) {
        if !state.enabled {
            debug!(service = %self.name, "Service disabled; not subscribing");
            return;
        }
        if state.subscribed {
            debug!(service = %self.name, "Topics already subscribed");
            return;
        }

        info!(service = %self.name, topics = state.topics.len(), "Subscribing for topics");
        let me = self.as_subscriber();
        for topic in &state.topics {
            let _ = broker.subscribe(topic, Arc::clone(&me));
        }
        state.subscribed = true;
    }

    fn execute_hook(&self, kind: HookKind, topic: &str, payload: &[u8]) -> Result<(), HookError> {
        let Some(command) = self.manifest.hook_command(kind) else {
            debug!(service = %self.name, hook = %kind, "Skipping hook execution: command is empty");
            return Ok(());
        };

        let environment = {
            let state = self.state();
            if !state.enabled {
                debug!(service = %self.name, topic, "Service disabled; dropping message");
                return Ok(());
            }
            state.environment.clone()
        };

        self.invoker.execute(&HookRequest {
            service: &self.name,
            kind,
            command,
            topic,
            payload,
            environment: &environment,
        })
    }
}

impl Subscriber for Service {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_message(&self, topic: &str, payload: &[u8]) -> RelayResult<()> {
        self.execute_hook(HookKind::OnReceive, topic, payload)?;
        Ok(())
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("manifest", &self.manifest)
            .field("state", &*self.state())
            .finish_non_exhaustive()
    }
}
