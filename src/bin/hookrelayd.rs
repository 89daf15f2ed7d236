//! hookrelay daemon
//!
//! Loads every service manifest, subscribes their topics and runs hooks for
//! incoming messages. With `--broker` messages come from an MQTT broker;
//! otherwise they are read from stdin, one per line, as `<topic> <payload>`
//! (the format of `mosquitto_sub -v`). With `--listen` the service listing is
//! served over HTTP.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hookrelay::api::{self, ListenAddress};
use hookrelay::config::DEFAULT_SERVICES_DIR;
use hookrelay::{
    EnvironmentWatcher, MemoryTransport, MqttAddress, MqttConfig, MqttTransport, Registry, RelayConfig, Transport,
};

/// Runs shell hooks for pub/sub messages.
#[derive(Debug, Parser)]
#[command(name = "hookrelayd", version, about)]
struct Args {
    /// Directory holding service manifests.
    #[arg(short = 'd', long = "dir", default_value = DEFAULT_SERVICES_DIR)]
    dir: PathBuf,

    /// MQTT broker address (tcp://host:port). Without it, messages are read
    /// from stdin.
    #[arg(short = 'b', long = "broker", env = "HOOKRELAY_BROKER")]
    broker: Option<MqttAddress>,

    /// API listen address (unix:///path or tcp://host:port).
    #[arg(short = 'l', long = "listen", env = "HOOKRELAY_LISTEN")]
    listen: Option<ListenAddress>,

    /// Log filter (error, warn, info, debug, trace or a tracing directive).
    #[arg(short = 'L', long = "log-level", env = "HOOKRELAY_LOG", default_value = "warn")]
    log_level: String,

    /// Print the loaded services as JSON and exit.
    #[arg(long)]
    list: bool,

    /// Do not create missing environment files.
    #[arg(long = "no-create-env")]
    no_create_env: bool,
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
    Ok(())
}

/// Splits a `<topic> <payload>` line. A line without a space is a message
/// with an empty payload.
fn split_message(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return None;
    }
    Some(line.split_once(' ').unwrap_or((line, "")))
}

fn spawn_stdin_bridge(transport: Arc<MemoryTransport>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("hookrelay-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = %err, "Failed to read message from stdin");
                        break;
                    }
                };
                let Some((topic, payload)) = split_message(&line) else {
                    continue;
                };
                let delivered = transport.publish(topic, payload.as_bytes());
                debug!(topic, delivered, "Message received");
            }
            info!("stdin closed; no further messages");
        })
}

/// Where messages come from.
enum Link {
    Mqtt(Arc<MqttTransport>),
    Stdin(Arc<MemoryTransport>),
}

impl Link {
    fn transport(&self) -> Arc<dyn Transport> {
        match self {
            Self::Mqtt(t) => Arc::clone(t) as Arc<dyn Transport>,
            Self::Stdin(t) => Arc::clone(t) as Arc<dyn Transport>,
        }
    }

    fn topics(&self) -> usize {
        match self {
            Self::Mqtt(t) => t.topics().len(),
            Self::Stdin(t) => t.topics().len(),
        }
    }

    fn close(&self) {
        match self {
            Self::Mqtt(t) => t.close(),
            Self::Stdin(t) => t.close(),
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM with the name of the signal.
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        let mut terminate = unix_signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
        tokio::select! {
            res = signal::ctrl_c() => {
                res.context("failed to listen for Ctrl+C")?;
                Ok("interrupt")
            }
            _ = terminate.recv() => Ok("terminate"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
        Ok("interrupt")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let config = RelayConfig {
        services_dir: args.dir,
        create_missing_env_files: !args.no_create_env,
        ..RelayConfig::default()
    };

    let link = match &args.broker {
        Some(address) if !args.list => {
            let transport = MqttTransport::start(&MqttConfig::new(address.clone()))
                .with_context(|| format!("failed to start MQTT client for {address}"))?;
            Link::Mqtt(Arc::new(transport))
        }
        _ => Link::Stdin(Arc::new(MemoryTransport::new())),
    };
    let registry = Arc::new(Registry::new(config, link.transport()));

    let loaded = registry
        .load_services()
        .with_context(|| format!("failed to load services from {}", registry.config().services_dir.display()))?;
    info!(services = loaded, "Services loaded");

    if args.list {
        println!("{}", serde_json::to_string_pretty(&registry.services())?);
        return Ok(());
    }

    let (watcher, changes) = EnvironmentWatcher::start(&registry.environment_files(), registry.config())?;
    let reloader = Arc::clone(&registry);
    let reload_worker = tokio::task::spawn_blocking(move || reloader.run(&changes));

    if let Link::Stdin(transport) = &link {
        spawn_stdin_bridge(Arc::clone(transport)).context("failed to spawn stdin reader")?;
    }

    let (api_stop, api_stopped) = oneshot::channel::<()>();
    let api_server = args.listen.clone().map(|address| {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let stopped = async move {
                let _ = api_stopped.await;
            };
            if let Err(err) = api::serve(&address, registry, stopped).await {
                error!(address = %address, error = %err, "API server failed");
            }
        })
    });

    info!(topics = link.topics(), "Relay running; press Ctrl+C to stop");
    tokio::select! {
        res = shutdown_signal() => {
            let name = res?;
            info!(signal = name, "Shutting down");
        }
        res = reload_worker => {
            res.context("reload worker panicked")?;
            warn!("Reload worker stopped; shutting down");
        }
    }

    let _ = api_stop.send(());
    if let Some(server) = api_server {
        if let Err(err) = server.await {
            warn!(error = %err, "API server task failed");
        }
    }
    drop(watcher);
    link.close();
    Ok(())
}
