//! File watcher for configuration tiers.
//!
//! Watches the tier directories for changes to `config.yaml` and emits events
//! through a tokio watch channel. Rapid edits are coalesced by the debouncer.

use super::loader::CONFIG_FILE;
use notify::RecommendedWatcher;
use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind, Debouncer, new_debouncer};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChangeEvent {
    /// One or more configuration files changed.
    Changed(Vec<PathBuf>),
    /// The watcher reported an error.
    Error(String),
}

impl ConfigChangeEvent {
    pub fn requires_reload(&self) -> bool {
        matches!(self, ConfigChangeEvent::Changed(_))
    }
}

/// Handle to a running watcher. Dropping it stops watching.
pub struct ConfigWatcherHandle {
    pub events: watch::Receiver<Option<ConfigChangeEvent>>,
    _debouncer: Debouncer<RecommendedWatcher>,
    _forwarder: tokio::task::JoinHandle<()>,
}

impl ConfigWatcherHandle {
    /// Wait for the next change. `None` once the watcher has stopped.
    pub async fn wait_for_change(&mut self) -> Option<ConfigChangeEvent> {
        while self.events.changed().await.is_ok() {
            if let Some(event) = self.events.borrow_and_update().clone() {
                return Some(event);
            }
        }
        None
    }
}

/// Start watching `dirs` (non-recursively).
///
/// Directories that do not exist are skipped with a warning.
pub fn start_config_watcher(
    dirs: Vec<PathBuf>,
    debounce: Duration,
) -> Result<ConfigWatcherHandle, notify::Error> {
    let (changes_tx, changes_rx) = watch::channel(None);
    let (batch_tx, batches) = mpsc::channel();

    let mut debouncer = new_debouncer(debounce, batch_tx)?;
    let watcher = debouncer.watcher();

    for dir in dirs.iter().filter(|dir| {
        let exists = dir.exists();
        if !exists {
            warn!(dir = %dir.display(), "Skipping missing config directory");
        }
        exists
    }) {
        watcher.watch(dir, notify::RecursiveMode::NonRecursive)?;
        info!(dir = %dir.display(), "Watching config tier");
    }

    let forwarder = tokio::task::spawn_blocking(move || forward_batches(batches, changes_tx));

    Ok(ConfigWatcherHandle {
        events: changes_rx,
        _debouncer: debouncer,
        _forwarder: forwarder,
    })
}

fn forward_batches(
    batches: mpsc::Receiver<Result<Vec<DebouncedEvent>, notify::Error>>,
    tx: watch::Sender<Option<ConfigChangeEvent>>,
) {
    // Ends when the debouncer is dropped
    for batch in batches {
        let event = match batch {
            Ok(events) => {
                match classify_changes(events.into_iter().map(|e| (e.path, e.kind))) {
                    Some(event) => event,
                    None => continue,
                }
            }
            Err(e) => {
                error!(error = %e, "Config watcher failed");
                ConfigChangeEvent::Error(e.to_string())
            }
        };

        debug!(?event, "Config tier changed");
        if tx.send(Some(event)).is_err() {
            debug!("No config listener left, stopping watcher");
            return;
        }
    }
    debug!("Config watcher stopped");
}

/// Collapse a debounced batch into one change event, or none if no
/// configuration file was touched.
fn classify_changes(
    changes: impl IntoIterator<Item = (PathBuf, DebouncedEventKind)>,
) -> Option<ConfigChangeEvent> {
    let mut changed: Vec<PathBuf> = changes
        .into_iter()
        .filter(|(_, kind)| {
            matches!(
                kind,
                DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
            )
        })
        .map(|(path, _)| path)
        .filter(|p| is_config_file(p))
        .collect();

    changed.sort();
    changed.dedup();
    (!changed.is_empty()).then_some(ConfigChangeEvent::Changed(changed))
}

fn is_config_file(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()) == Some(CONFIG_FILE)
}
