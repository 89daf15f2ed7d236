//! Environment file watcher.
//!
//! Watches the parent directory of every environment file (editors replace
//! files by rename, which a watch on the file itself would lose) and reports
//! changed files, by the path the manifests use, on a bounded channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::RegistryError;

/// Keeps the underlying OS watch alive; dropping it stops notifications.
pub struct EnvironmentWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    directories: Vec<PathBuf>,
}

impl EnvironmentWatcher {
    /// Starts watching `files`. Returns the watcher and the receiving end of
    /// the change channel.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Watcher`] if the OS watcher cannot be created or a
    /// directory cannot be watched.
    pub fn start(files: &[PathBuf], config: &RelayConfig) -> Result<(Self, Receiver<PathBuf>), RegistryError> {
        let targets = watch_targets(files);
        let (tx, rx) = bounded::<PathBuf>(config.watch_queue_capacity.max(1));

        let lookup = targets.by_canonical;
        let mut debouncer = new_debouncer(config.watch_debounce, move |result: DebounceEventResult| {
            forward_events(&lookup, &tx, result);
        })
        .map_err(watcher_err)?;

        for dir in &targets.directories {
            debouncer
                .watcher()
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(watcher_err)?;
            info!(dir = %dir.display(), "Watching environment directory");
        }

        Ok((
            Self {
                _debouncer: debouncer,
                directories: targets.directories,
            },
            rx,
        ))
    }

    /// Watched directories.
    #[must_use]
    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }
}

impl std::fmt::Debug for EnvironmentWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentWatcher")
            .field("directories", &self.directories)
            .finish_non_exhaustive()
    }
}

fn watcher_err(err: notify::Error) -> RegistryError {
    RegistryError::Watcher {
        message: err.to_string(),
    }
}

#[derive(Debug, Default)]
struct WatchTargets {
    directories: Vec<PathBuf>,
    by_canonical: HashMap<PathBuf, Vec<PathBuf>>,
}

/// Canonical location of `file`, resolved through its parent directory so
/// that files which do not exist yet still map.
fn canonical_location(file: &Path) -> Option<(PathBuf, PathBuf)> {
    let name = file.file_name()?;
    let parent = match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let dir = parent.canonicalize().ok()?;
    let full = dir.join(name);
    Some((dir, full))
}

fn watch_targets(files: &[PathBuf]) -> WatchTargets {
    let mut targets = WatchTargets::default();

    for file in files {
        let Some((dir, full)) = canonical_location(file) else {
            warn!(file = %file.display(), "Cannot watch environment file: parent directory unavailable");
            continue;
        };
        if !targets.directories.contains(&dir) {
            targets.directories.push(dir);
        }
        let aliases = targets.by_canonical.entry(full).or_default();
        if !aliases.contains(file) {
            aliases.push(file.clone());
        }
    }

    targets
}

fn forward_events(lookup: &HashMap<PathBuf, Vec<PathBuf>>, tx: &Sender<PathBuf>, result: DebounceEventResult) {
    let events = match result {
        Ok(events) => events,
        Err(err) => {
            warn!(error = %err, "File watcher error");
            return;
        }
    };

    for event in events {
        let Some(aliases) = lookup.get(&event.path) else {
            continue;
        };
        for path in aliases {
            debug!(file = %path.display(), "Environment file changed");
            match tx.try_send(path.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(path)) => {
                    warn!(file = %path.display(), "Change queue full; notification dropped");
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind};

    use super::*;

    fn event(path: PathBuf) -> DebouncedEvent {
        DebouncedEvent {
            path,
            kind: DebouncedEventKind::Any,
        }
    }

    #[test]
    fn test_targets_share_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.env");
        let b = dir.path().join("b.env");

        let targets = watch_targets(&[a.clone(), b.clone(), a.clone()]);

        assert_eq!(targets.directories.len(), 1);
        assert_eq!(targets.by_canonical.len(), 2);
        let canonical_dir = dir.path().canonicalize().unwrap();
        assert_eq!(targets.by_canonical[&canonical_dir.join("a.env")], vec![a]);
    }

    #[test]
    fn test_missing_parent_is_skipped() {
        let targets = watch_targets(&[PathBuf::from("/definitely/not/here/x.env")]);
        assert!(targets.directories.is_empty());
    }

    #[test]
    fn test_forward_maps_back_to_manifest_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("svc.env");
        let targets = watch_targets(std::slice::from_ref(&file));
        let (tx, rx) = bounded(4);

        let canonical = dir.path().canonicalize().unwrap();
        let events = vec![
            event(canonical.join("svc.env")),
            event(canonical.join("unrelated.txt")),
        ];
        forward_events(&targets.by_canonical, &tx, Ok(events));

        assert_eq!(rx.try_recv().unwrap(), file);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("svc.env");
        let targets = watch_targets(std::slice::from_ref(&file));
        let (tx, rx) = bounded(1);

        let canonical = dir.path().canonicalize().unwrap().join("svc.env");
        for _ in 0..3 {
            forward_events(&targets.by_canonical, &tx, Ok(vec![event(canonical.clone())]));
        }

        assert_eq!(rx.len(), 1);
    }
}
