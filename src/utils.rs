//! Miscellaneous helper utilities.
use std::path::Path;
use std::sync::Arc;

/// Whether two `Arc`s point to the same object, ignoring trait object
/// metadata.
#[must_use]
pub fn same_arc<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Ensure a file path's parent directory exists.
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
