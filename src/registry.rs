//! Service registry.
//!
//! Discovers manifests in the services directory, owns the resulting
//! services and routes environment file changes to the services that read
//! them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use crossbeam_channel::Receiver;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::RelayConfig;
use crate::environment::{self, DotenvSource, EnvironmentSource};
use crate::error::RegistryError;
use crate::hook::{HookInvoker, ShellInvoker};
use crate::manifest::Manifest;
use crate::service::{Service, ServiceSnapshot};
use crate::transport::Transport;

/// All services known to the relay.
pub struct Registry {
    config: RelayConfig,
    broker: Broker,
    source: Arc<dyn EnvironmentSource>,
    invoker: Arc<dyn HookInvoker>,
    services: RwLock<Vec<Arc<Service>>>,
    loaded: AtomicBool,
}

impl Registry {
    /// Registry reading `.env` files with dotenvy and running hooks through
    /// the shell.
    #[must_use]
    pub fn new(config: RelayConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_collaborators(config, transport, Arc::new(DotenvSource), Arc::new(ShellInvoker::default()))
    }

    /// Registry with explicit environment reader and hook invoker.
    #[must_use]
    pub fn with_collaborators(
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        source: Arc<dyn EnvironmentSource>,
        invoker: Arc<dyn HookInvoker>,
    ) -> Self {
        Self {
            config,
            broker: Broker::new(transport),
            source,
            invoker,
            services: RwLock::new(Vec::new()),
            loaded: AtomicBool::new(false),
        }
    }

    fn read_services(&self) -> RwLockReadGuard<'_, Vec<Arc<Service>>> {
        self.services.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The broker services subscribe through.
    #[must_use]
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Manifest paths in the services directory, sorted by file name.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotADirectory`] or [`RegistryError::Scan`] if the
    /// directory cannot be listed.
    pub fn manifest_paths(&self) -> Result<Vec<PathBuf>, RegistryError> {
        let dir = &self.config.services_dir;
        if !dir.is_dir() {
            return Err(RegistryError::NotADirectory { path: dir.clone() });
        }

        let scan_err = |source: std::io::Error| RegistryError::Scan {
            path: dir.clone(),
            source,
        };

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(scan_err)? {
            let path = entry.map_err(scan_err)?.path();
            let matches_ext = path
                .extension()
                .is_some_and(|ext| ext == self.config.manifest_extension.as_str());
            if matches_ext && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Loads every manifest, initializes the services, then subscribes all
    /// enabled services. Manifests that fail to parse are skipped. Returns
    /// the number of services loaded.
    ///
    /// Services are registered before the subscribe sweep, so a change
    /// notification arriving mid-sweep already reaches them.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyLoaded`] on a second call, otherwise see
    /// [`Registry::manifest_paths`].
    pub fn load_services(&self) -> Result<usize, RegistryError> {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return Err(RegistryError::AlreadyLoaded {
                path: self.config.services_dir.clone(),
            });
        }
        let paths = match self.manifest_paths() {
            Ok(paths) => paths,
            Err(err) => {
                self.loaded.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        info!(dir = %self.config.services_dir.display(), manifests = paths.len(), "Loading services");

        let mut loaded = Vec::with_capacity(paths.len());
        for path in paths {
            let manifest = match Manifest::load(&path) {
                Ok(manifest) => manifest,
                Err(err) => {
                    warn!(error = %err, "Skipping service");
                    continue;
                }
            };
            let name = service_name(&path);
            loaded.push(self.prepare(name, manifest));
        }

        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(loaded.iter().cloned());

        for service in &loaded {
            service.subscribe(&self.broker);
        }
        Ok(loaded.len())
    }

    /// Adds one service built from an already parsed manifest, initializes
    /// and subscribes it.
    pub fn add_service(&self, name: impl Into<String>, manifest: Manifest) -> Arc<Service> {
        let service = self.prepare(name.into(), manifest);
        service.subscribe(&self.broker);
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&service));
        service
    }

    fn prepare(&self, name: String, manifest: Manifest) -> Arc<Service> {
        if self.config.create_missing_env_files {
            for file in &manifest.environment_files {
                match environment::create_if_missing(file) {
                    Ok(true) => info!(service = %name, file = %file.display(), "Created empty environment file"),
                    Ok(false) => {}
                    Err(err) => warn!(service = %name, file = %file.display(), error = %err, "Cannot create environment file"),
                }
            }
        }

        let service = Service::new(name, manifest, Arc::clone(&self.invoker));
        service.initialize(self.source.as_ref(), &self.broker);
        service
    }

    /// Reloads every service that reads `file`. Returns how many services
    /// were reloaded.
    pub fn on_environment_file_changed(&self, file: &Path) -> usize {
        let affected: Vec<Arc<Service>> = self
            .read_services()
            .iter()
            .filter(|s| s.depends_on(file))
            .cloned()
            .collect();

        if affected.is_empty() {
            debug!(file = %file.display(), "No service depends on changed file");
        }
        for service in &affected {
            info!(service = %service.name(), file = %file.display(), "Environment file changed; reloading service");
            service.reload(self.source.as_ref(), &self.broker);
        }
        affected.len()
    }

    /// Every environment file referenced by a loaded service, deduplicated,
    /// in first-seen order.
    #[must_use]
    pub fn environment_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = Vec::new();
        for service in self.read_services().iter() {
            for file in &service.manifest().environment_files {
                if !files.contains(file) {
                    files.push(file.clone());
                }
            }
        }
        files
    }

    /// Snapshots of every service, in load order.
    #[must_use]
    pub fn services(&self) -> Vec<ServiceSnapshot> {
        self.read_services().iter().map(|s| s.snapshot()).collect()
    }

    /// Service by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.read_services().iter().find(|s| s.name() == name).cloned()
    }

    /// Applies file-change notifications until the channel disconnects.
    pub fn run(&self, changes: &Receiver<PathBuf>) {
        for file in changes {
            self.on_environment_file_changed(&file);
        }
        error!("File change channel closed; no further reloads");
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("services", &self.read_services().len())
            .finish_non_exhaustive()
    }
}

fn service_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::transport::MemoryTransport;

    fn registry(dir: &Path) -> (Arc<MemoryTransport>, Registry) {
        let transport = Arc::new(MemoryTransport::new());
        let registry = Registry::new(RelayConfig::with_services_dir(dir), transport.clone());
        (transport, registry)
    }

    #[test]
    fn test_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, "").unwrap();

        let (_, registry) = registry(&file);
        assert!(matches!(
            registry.load_services(),
            Err(RegistryError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_manifest_paths_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.yaml"), "Topics: []").unwrap();
        fs::write(dir.path().join("a.yaml"), "Topics: []").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::create_dir(dir.path().join("sub.yaml")).unwrap();

        let (_, registry) = registry(dir.path());
        let names: Vec<String> = registry
            .manifest_paths()
            .unwrap()
            .iter()
            .map(|p| service_name(p))
            .collect();
        assert_eq!(names, vec!["a.yaml", "b.yaml"]);
    }

    #[test]
    fn test_load_skips_broken_manifest_and_creates_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("svc.env");
        fs::write(
            dir.path().join("good.yaml"),
            format!("Topics: [static]\nEnvironmentFiles: [{}]\n", env_file.display()),
        )
        .unwrap();
        fs::write(dir.path().join("bad.yaml"), "Topics: {not: [closed").unwrap();

        let (transport, registry) = registry(dir.path());
        assert_eq!(registry.load_services().unwrap(), 1);

        assert!(env_file.exists());
        assert_eq!(transport.topics(), vec!["static"]);
        assert!(registry.service("good.yaml").is_some());
        assert!(registry.service("bad.yaml").is_none());
        assert_eq!(registry.environment_files(), vec![env_file]);
    }

    #[test]
    fn test_env_change_reloads_dependent_services_only() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("svc.env");
        fs::write(&env_file, "ID=1\n").unwrap();
        fs::write(
            dir.path().join("dyn.yaml"),
            format!("Topics: [\"dev/{{ID}}\"]\nEnvironmentFiles: [{}]\n", env_file.display()),
        )
        .unwrap();
        fs::write(dir.path().join("other.yaml"), "Topics: [fixed]\n").unwrap();

        let (transport, registry) = registry(dir.path());
        registry.load_services().unwrap();
        assert_eq!(transport.topics(), vec!["dev/1", "fixed"]);

        fs::write(&env_file, "ID=2\n").unwrap();
        assert_eq!(registry.on_environment_file_changed(&env_file), 1);
        assert_eq!(transport.topics(), vec!["dev/2", "fixed"]);

        assert_eq!(registry.on_environment_file_changed(Path::new("/unrelated.env")), 0);
    }

    #[test]
    fn test_second_load_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.yaml"), "Topics: [x]\n").unwrap();

        let (transport, registry) = registry(dir.path());
        assert_eq!(registry.load_services().unwrap(), 1);
        assert!(matches!(
            registry.load_services(),
            Err(RegistryError::AlreadyLoaded { .. })
        ));
        assert_eq!(registry.services().len(), 1);

        let service = registry.service("a.yaml").unwrap();
        let me: Arc<dyn crate::broker::Subscriber> = service;
        assert_eq!(registry.broker().registrations("x", &me), 1);
        assert_eq!(transport.topics(), vec!["x"]);
    }

    #[test]
    fn test_failed_load_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let services = dir.path().join("services");

        let (_, registry) = registry(&services);
        assert!(registry.load_services().is_err());

        fs::create_dir(&services).unwrap();
        fs::write(services.join("a.yaml"), "Topics: [x]\n").unwrap();
        assert_eq!(registry.load_services().unwrap(), 1);
    }

    #[test]
    fn test_change_right_after_load_subscribes_once() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("svc.env");
        fs::write(&env_file, "ID=1\n").unwrap();
        fs::write(
            dir.path().join("dyn.yaml"),
            format!("Topics: [\"dev/{{ID}}\"]\nEnvironmentFiles: [{}]\n", env_file.display()),
        )
        .unwrap();

        let (transport, registry) = registry(dir.path());
        registry.load_services().unwrap();
        assert_eq!(registry.on_environment_file_changed(&env_file), 1);

        let service = registry.service("dyn.yaml").unwrap();
        service.subscribe(registry.broker());
        let me: Arc<dyn crate::broker::Subscriber> = service;
        assert_eq!(registry.broker().registrations("dev/1", &me), 1);
        assert_eq!(transport.topics(), vec!["dev/1"]);
    }

    #[test]
    fn test_services_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.yaml"), "Description: first\nTopics: [x]\n").unwrap();

        let (_, registry) = registry(dir.path());
        registry.load_services().unwrap();

        let snapshots = registry.services();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "a.yaml");
        assert_eq!(snapshots[0].description, "first");
        assert_eq!(snapshots[0].topics, vec!["x"]);
    }

    #[test]
    fn test_run_drains_channel() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("svc.env");
        fs::write(&env_file, "ID=1\n").unwrap();

        let (transport, registry) = registry(dir.path());
        registry.add_service(
            "svc",
            Manifest {
                topics: vec!["t/{ID}".to_string()],
                environment_files: vec![env_file.clone()],
                ..Manifest::default()
            },
        );
        assert_eq!(transport.topics(), vec!["t/1"]);

        let (tx, rx) = crossbeam_channel::unbounded();
        fs::write(&env_file, "ID=5\n").unwrap();
        tx.send(env_file).unwrap();
        drop(tx);

        registry.run(&rx);
        assert_eq!(transport.topics(), vec!["t/5"]);
    }
}
