//! Local storage: free-space checks and the on-disk package layout

mod guard;
mod packages;

pub use guard::{DiskSpaceProbe, FreeSpaceProbe, StorageGuard};
pub use packages::{LocalPackage, PackageStore, QueueEntry};

#[cfg(test)]
pub(crate) use guard::FixedSpaceProbe;
