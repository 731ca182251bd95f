//! Registry backend trait
//!
//! A registry pushes two streams of route programs into the router: the
//! program generated from the currently healthy service instances, and the
//! administrator-maintained manual overlay. Manual entries are stored under
//! named paths and updated with optimistic concurrency.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Stream of complete route programs; every item replaces the previous one
pub type ProgramStream = BoxStream<'static, String>;

/// A manual overlay value and the version it was read at
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualEntry {
    pub value: String,
    /// Zero when the entry does not exist yet
    pub version: u64,
}

/// Registry backend
///
/// Implementations:
/// - `MemoryRegistry`: programs pushed in-process (static config, tests)
/// - `FileRegistry`: a services program file plus a directory of manual entries
///
/// # Example
/// ```no_run
/// # use switchyard_core::registry::Registry;
/// # use futures::StreamExt;
/// # async fn example(registry: &dyn Registry) -> switchyard_core::Result<()> {
/// let mut services = registry.watch_services().await?;
/// while let Some(program) = services.next().await {
///     println!("{} bytes of routes", program.len());
/// }
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Registry: Send + Sync {
    /// Watch the service-derived program
    ///
    /// The current value is sent first, then one item per change. The stream
    /// stays open across transient backend errors; it ends only when the
    /// backend shuts down.
    async fn watch_services(&self) -> Result<ProgramStream>;

    /// Watch the manual overlay program, with the same contract as `watch_services`
    async fn watch_manual(&self) -> Result<ProgramStream>;

    /// List the manual entry paths
    async fn manual_paths(&self) -> Result<Vec<String>>;

    /// Read a manual entry
    ///
    /// A missing entry reads as an empty value at version 0.
    async fn read_manual(&self, path: &str) -> Result<ManualEntry>;

    /// Write a manual entry if its current version equals `expected_version`
    ///
    /// # Returns
    /// The new version.
    ///
    /// # Errors
    /// - `Error::VersionConflict` if the entry changed since it was read
    async fn write_manual(&self, path: &str, value: &str, expected_version: u64) -> Result<u64>;
}
