//! Registry backends
//!
//! - [`MemoryRegistry`]: programs pushed in-process, used for static
//!   configuration, embedding and tests
//! - [`FileRegistry`]: a services program file plus a directory of manual
//!   entries, watched with `notify`

pub mod file;
pub mod memory;

pub use file::FileRegistry;
pub use memory::MemoryRegistry;

/// Normalize a manual entry path: surrounding slashes trimmed, empty means `root`
pub(crate) fn manual_key(root: &str, path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        root.to_string()
    } else {
        trimmed.to_string()
    }
}
