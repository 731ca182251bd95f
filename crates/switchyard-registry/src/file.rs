//! File-based registry backend
//!
//! The services program is read from a single file. Manual entries are files
//! under a directory, addressed by their path relative to it. Both are watched
//! with `notify` and re-read on change; a stream item is only sent when the
//! program text actually changed.
//!
//! Versions are derived from the entry content, so a compare-and-set fails
//! whenever the file was edited since it was read, whoever edited it.

use async_trait::async_trait;
use futures::stream;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use switchyard_core::{Error, ManualEntry, ProgramStream, Registry, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::manual_key;

/// How often the blocking watcher loop checks whether its stream was dropped
const CLOSE_POLL: Duration = Duration::from_millis(500);
/// Quiet period after the last file event before the file is re-read
const SETTLE: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct FileRegistry {
    services_path: PathBuf,
    manual_dir: PathBuf,
    root: String,
    /// Serializes compare-and-set writes from this process
    write_lock: Mutex<()>,
}

#[derive(Debug, Clone, Copy)]
enum Watched {
    Services,
    Manual,
}

impl FileRegistry {
    /// Create a file registry
    ///
    /// # Arguments
    /// * `services_path` - File holding the services program; a missing file reads as empty
    /// * `manual_dir` - Directory of manual entries, created if missing
    /// * `root` - Name of the default manual entry
    ///
    /// # Errors
    /// - `Error::Io` if the manual directory cannot be created
    pub fn new(
        services_path: impl Into<PathBuf>,
        manual_dir: impl Into<PathBuf>,
        root: impl Into<String>,
    ) -> Result<Self> {
        let services_path = services_path.into();
        let manual_dir = manual_dir.into();
        std::fs::create_dir_all(&manual_dir)?;

        info!(
            "Initialized FileRegistry (services: {:?}, manual: {:?})",
            services_path, manual_dir
        );

        Ok(Self {
            services_path,
            manual_dir,
            root: root.into(),
            write_lock: Mutex::new(()),
        })
    }

    fn entry_path(&self, path: &str) -> Result<(String, PathBuf)> {
        let key = manual_key(&self.root, path);
        let relative = Path::new(&key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::ManualNotFound(key));
        }
        let full = self.manual_dir.join(relative);
        Ok((key, full))
    }

    fn spawn_watch(&self, which: Watched) -> Result<ProgramStream> {
        let (tx, rx) = mpsc::channel::<String>(100);
        let services_path = self.services_path.clone();
        let manual_dir = self.manual_dir.clone();

        let read = move || match which {
            Watched::Services => read_services(&services_path),
            Watched::Manual => read_manual_program(&manual_dir),
        };

        let initial = read();
        let (watch_path, mode) = match which {
            Watched::Services => (
                self.services_path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from(".")),
                RecursiveMode::NonRecursive,
            ),
            Watched::Manual => (self.manual_dir.clone(), RecursiveMode::Recursive),
        };

        let (notify_tx, notify_rx) = std::sync::mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                if let Err(e) = notify_tx.send(res) {
                    debug!("Failed to forward file watch event: {}", e);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::Registry(format!("failed to create file watcher: {}", e)))?;
        watcher
            .watch(&watch_path, mode)
            .map_err(|e| Error::Registry(format!("failed to watch {:?}: {}", watch_path, e)))?;

        info!("Watching {:?} for registry changes", watch_path);

        tokio::task::spawn_blocking(move || {
            // keep the watcher alive for the lifetime of the stream
            let _watcher = watcher;
            let mut last = initial.clone();
            if tx.blocking_send(initial).is_err() {
                return;
            }

            loop {
                match notify_rx.recv_timeout(CLOSE_POLL) {
                    Ok(Ok(event)) => {
                        if !is_change(&event) {
                            continue;
                        }
                        // writers truncate before writing; read once the burst is over
                        if !settle(&notify_rx) {
                            error!("File watcher disconnected");
                            return;
                        }
                        let current = read();
                        if current == last {
                            continue;
                        }
                        last = current.clone();
                        if tx.blocking_send(current).is_err() {
                            debug!("Registry stream closed, stopping watcher");
                            return;
                        }
                    }
                    Ok(Err(e)) => warn!("File watch error: {}", e),
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        if tx.is_closed() {
                            return;
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                        error!("File watcher disconnected");
                        return;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }
}

fn is_change(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}

/// Swallow events until none arrived for `SETTLE`; false if the watcher is gone
fn settle(events: &std::sync::mpsc::Receiver<notify::Result<Event>>) -> bool {
    loop {
        match events.recv_timeout(SETTLE) {
            Ok(_) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => return true,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return false,
        }
    }
}

fn read_services(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            warn!("Failed to read services file {:?}: {}", path, e);
            String::new()
        }
    }
}

fn read_manual_program(dir: &Path) -> String {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files);
    files.sort();
    files
        .iter()
        .filter_map(|relative| std::fs::read_to_string(dir.join(relative)).ok())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Relative paths of every regular, non-hidden file under `dir`
fn collect_files(base: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden {
            continue;
        }
        if path.is_dir() {
            collect_files(base, &path, out);
        } else if let Ok(relative) = path.strip_prefix(base) {
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(key);
        }
    }
}

fn content_version(contents: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    contents.hash(&mut hasher);
    // 0 is reserved for a missing entry
    hasher.finish().max(1)
}

fn read_entry(path: &Path) -> Result<ManualEntry> {
    match std::fs::read_to_string(path) {
        Ok(value) => {
            let version = content_version(&value);
            Ok(ManualEntry { value, version })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ManualEntry::default()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[async_trait]
impl Registry for FileRegistry {
    async fn watch_services(&self) -> Result<ProgramStream> {
        self.spawn_watch(Watched::Services)
    }

    async fn watch_manual(&self) -> Result<ProgramStream> {
        self.spawn_watch(Watched::Manual)
    }

    async fn manual_paths(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        collect_files(&self.manual_dir, &self.manual_dir, &mut files);
        files.sort();
        Ok(files)
    }

    async fn read_manual(&self, path: &str) -> Result<ManualEntry> {
        let (_, full) = self.entry_path(path)?;
        read_entry(&full)
    }

    async fn write_manual(&self, path: &str, value: &str, expected_version: u64) -> Result<u64> {
        let (key, full) = self.entry_path(path)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        let actual = read_entry(&full)?.version;
        if actual != expected_version {
            return Err(Error::VersionConflict {
                expected: expected_version,
                actual,
            });
        }

        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = full.with_file_name(format!(
            ".{}.tmp",
            full.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &full)?;

        let version = content_version(value);
        info!(path = %key, version, "manual entry written");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_version_is_never_zero() {
        assert_ne!(content_version(""), 0);
        assert_eq!(content_version("a"), content_version("a"));
        assert_ne!(content_version("a"), content_version("b"));
    }

    #[test]
    fn test_entry_path_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            FileRegistry::new(dir.path().join("services"), dir.path().join("manual"), "manual")
                .unwrap();
        assert!(registry.entry_path("../etc/passwd").is_err());
        let (key, full) = registry.entry_path("/manual/canary").unwrap();
        assert_eq!(key, "manual/canary");
        assert!(full.ends_with("manual/manual/canary"));
    }
}
