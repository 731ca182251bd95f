//! In-memory registry backend

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Mutex;
use switchyard_core::{Error, ManualEntry, ProgramStream, Registry, Result};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::manual_key;

/// Registry whose programs are pushed by the embedding process
///
/// The services program is replaced wholesale with [`set_services`]; manual
/// entries are written through the [`Registry`] interface and exposed to
/// watchers as one program, concatenated in path order.
///
/// [`set_services`]: MemoryRegistry::set_services
pub struct MemoryRegistry {
    root: String,
    services: watch::Sender<String>,
    manual_program: watch::Sender<String>,
    manual: Mutex<ManualStore>,
}

#[derive(Default)]
struct ManualStore {
    entries: BTreeMap<String, ManualEntry>,
    last_version: u64,
}

impl ManualStore {
    fn program(&self) -> String {
        self.entries
            .values()
            .map(|e| e.value.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl MemoryRegistry {
    /// Create an empty registry; `root` names the default manual entry
    pub fn new(root: impl Into<String>) -> Self {
        let (services, _) = watch::channel(String::new());
        let (manual_program, _) = watch::channel(String::new());
        Self {
            root: root.into(),
            services,
            manual_program,
            manual: Mutex::new(ManualStore::default()),
        }
    }

    /// Create a registry serving a fixed services program
    pub fn with_services(root: impl Into<String>, program: impl Into<String>) -> Self {
        let registry = Self::new(root);
        registry.set_services(program);
        registry
    }

    /// Replace the services program
    pub fn set_services(&self, program: impl Into<String>) {
        self.services.send_replace(program.into());
    }

    pub fn services(&self) -> String {
        self.services.borrow().clone()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn watch_services(&self) -> Result<ProgramStream> {
        Ok(WatchStream::new(self.services.subscribe()).boxed())
    }

    async fn watch_manual(&self) -> Result<ProgramStream> {
        Ok(WatchStream::new(self.manual_program.subscribe()).boxed())
    }

    async fn manual_paths(&self) -> Result<Vec<String>> {
        let store = self.manual.lock().unwrap_or_else(|p| p.into_inner());
        Ok(store.entries.keys().cloned().collect())
    }

    async fn read_manual(&self, path: &str) -> Result<ManualEntry> {
        let key = manual_key(&self.root, path);
        let store = self.manual.lock().unwrap_or_else(|p| p.into_inner());
        Ok(store.entries.get(&key).cloned().unwrap_or_default())
    }

    async fn write_manual(&self, path: &str, value: &str, expected_version: u64) -> Result<u64> {
        let key = manual_key(&self.root, path);
        let mut store = self.manual.lock().unwrap_or_else(|p| p.into_inner());

        let actual = store.entries.get(&key).map(|e| e.version).unwrap_or(0);
        if actual != expected_version {
            return Err(Error::VersionConflict {
                expected: expected_version,
                actual,
            });
        }

        store.last_version += 1;
        let version = store.last_version;
        store.entries.insert(
            key.clone(),
            ManualEntry {
                value: value.to_string(),
                version,
            },
        );
        self.manual_program.send_replace(store.program());

        tracing::info!(path = %key, version, "manual entry updated");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_services_stream_sends_current_then_changes() {
        let registry = MemoryRegistry::with_services("manual", "route add a / http://a/");
        let mut stream = registry.watch_services().await.unwrap();
        assert_eq!(stream.next().await.unwrap(), "route add a / http://a/");

        registry.set_services("route add b / http://b/");
        assert_eq!(stream.next().await.unwrap(), "route add b / http://b/");
    }

    #[tokio::test]
    async fn test_manual_cas() {
        let registry = MemoryRegistry::new("manual");
        assert_eq!(registry.read_manual("").await.unwrap(), ManualEntry::default());

        let v1 = registry.write_manual("", "route del * * http://a/", 0).await.unwrap();
        assert!(v1 > 0);

        let err = registry.write_manual("manual", "x", 0).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict { expected: 0, actual } if actual == v1));

        let v2 = registry.write_manual("/manual", "", v1).await.unwrap();
        assert!(v2 > v1);
        assert_eq!(registry.read_manual("manual").await.unwrap().version, v2);
    }

    #[tokio::test]
    async fn test_manual_program_concatenates_in_path_order() {
        let registry = MemoryRegistry::new("manual");
        registry.write_manual("manual/b", "route del s2", 0).await.unwrap();
        registry.write_manual("manual", "route del s0", 0).await.unwrap();
        registry.write_manual("manual/a", "route del s1", 0).await.unwrap();

        let mut stream = registry.watch_manual().await.unwrap();
        assert_eq!(
            stream.next().await.unwrap(),
            "route del s0\nroute del s1\nroute del s2"
        );
        assert_eq!(
            registry.manual_paths().await.unwrap(),
            vec!["manual", "manual/a", "manual/b"]
        );
    }
}
