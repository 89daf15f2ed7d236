//! Hook execution.
//!
//! Hooks are shell command lines from the service manifest. They run with the
//! service environment plus `TOPIC`, receive the message payload on stdin and
//! are never awaited.

use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;

use crossbeam_channel::{SendError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::environment::Environment;
use crate::error::HookError;

/// Variable injected into every hook environment.
pub const TOPIC_VAR: &str = "TOPIC";

/// Hooks a manifest can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    /// Runs for every message delivered to the service.
    OnReceive,
}

impl HookKind {
    /// Name used in manifests and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OnReceive => "OnReceive",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to start one hook.
#[derive(Debug, Clone, Copy)]
pub struct HookRequest<'a> {
    /// Service the hook belongs to.
    pub service: &'a str,
    /// Which hook is running.
    pub kind: HookKind,
    /// Shell command line.
    pub command: &'a str,
    /// Topic the message arrived on.
    pub topic: &'a str,
    /// Message payload, written to stdin.
    pub payload: &'a [u8],
    /// Service environment.
    pub environment: &'a Environment,
}

/// Starts hook processes.
///
/// Implementations must return as soon as the hook has started: message
/// dispatch calls this inline.
pub trait HookInvoker: Send + Sync {
    /// Starts the hook described by `request`. An empty command is a no-op.
    ///
    /// # Errors
    ///
    /// [`HookError::Spawn`] if the process could not be started.
    fn execute(&self, request: &HookRequest<'_>) -> Result<(), HookError>;
}

/// Runs hooks through `/bin/sh -c`.
#[derive(Debug, Clone)]
pub struct ShellInvoker {
    shell: PathBuf,
}

impl ShellInvoker {
    /// Uses `shell` instead of `/bin/sh`.
    #[must_use]
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self { shell: shell.into() }
    }

    fn command(&self, request: &HookRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(request.command)
            .env_clear()
            .envs(request.environment)
            .env(TOPIC_VAR, request.topic)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl Default for ShellInvoker {
    fn default() -> Self {
        Self::with_shell("/bin/sh")
    }
}

impl HookInvoker for ShellInvoker {
    fn execute(&self, request: &HookRequest<'_>) -> Result<(), HookError> {
        if request.command.trim().is_empty() {
            return Ok(());
        }

        let spawn_err = |source: io::Error| HookError::Spawn {
            service: request.service.to_string(),
            hook: request.kind,
            source,
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            let mut keys: Vec<&str> = request.environment.keys().map(String::as_str).collect();
            keys.sort_unstable();
            debug!(
                service = request.service,
                hook = %request.kind,
                cmd = request.command,
                env = ?keys,
                payload_len = request.payload.len(),
                "Executing hook"
            );
        } else {
            info!(service = request.service, hook = %request.kind, "Executing hook");
        }

        // The reaper thread exists before the child does, so a started hook
        // always has someone to wait for it.
        let (reaper, _) = spawn_reaper(request.service.to_string()).map_err(spawn_err)?;
        let child = self.command(request).spawn().map_err(spawn_err)?;

        if let Err(SendError((mut child, _))) = reaper.send((child, request.payload.to_vec())) {
            warn!(service = request.service, "Hook reaper gone; killing hook");
            let _ = child.kill();
            let _ = child.wait();
        }
        Ok(())
    }
}

type Reaped = (Child, Vec<u8>);

/// Starts a thread that feeds and reaps one child sent over the returned
/// channel. Dropping the sender without sending ends the thread.
fn spawn_reaper(service: String) -> io::Result<(Sender<Reaped>, thread::JoinHandle<()>)> {
    let (tx, rx) = crossbeam_channel::bounded::<Reaped>(1);
    let handle = thread::Builder::new()
        .name("hookrelay-hook".to_string())
        .spawn(move || {
            if let Ok((child, payload)) = rx.recv() {
                feed_and_reap(&service, child, &payload);
            }
        })?;
    Ok((tx, handle))
}

/// Writes the payload, closes stdin and reaps the child.
fn feed_and_reap(service: &str, mut child: Child, payload: &[u8]) {
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(payload) {
            if e.kind() != io::ErrorKind::BrokenPipe {
                warn!(service, error = %e, "Failed to write hook payload");
            }
        }
    }

    match child.wait() {
        Ok(status) => debug!(service, %status, "Hook finished"),
        Err(e) => warn!(service, error = %e, "Failed to wait for hook"),
    }
}
