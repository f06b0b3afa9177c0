use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::{DownloadError, Error, Result};
use crate::utils::{get_available_space, nearest_existing_ancestor};

/// Source of free-space figures for a volume
pub trait FreeSpaceProbe: Send + Sync {
    /// Bytes available to the current user on the volume holding `path`
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64>;
}

/// Probe backed by the operating system (`statvfs` / `GetDiskFreeSpaceExW`)
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskSpaceProbe;

impl FreeSpaceProbe for DiskSpaceProbe {
    fn free_bytes(&self, path: &Path) -> std::io::Result<u64> {
        let existing = nearest_existing_ancestor(path).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no existing directory above {}", path.display()),
            )
        })?;
        get_available_space(existing)
    }
}

/// Answers whether a download of a given size fits on the data volume
///
/// Every answer is a fresh probe; nothing is cached, because free space changes
/// underneath us.
#[derive(Clone)]
pub struct StorageGuard {
    probe: Arc<dyn FreeSpaceProbe>,
    volume: PathBuf,
    safety_margin: u64,
    enabled: bool,
}

impl fmt::Debug for StorageGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageGuard")
            .field("volume", &self.volume)
            .field("safety_margin", &self.safety_margin)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl StorageGuard {
    /// Guard for the configured data directory
    pub fn new(config: &StorageConfig, probe: Arc<dyn FreeSpaceProbe>) -> Self {
        Self {
            probe,
            volume: config.data_dir.clone(),
            safety_margin: config.safety_margin_bytes,
            enabled: config.disk_space_check,
        }
    }

    /// Bytes kept free in addition to every package
    pub fn safety_margin(&self) -> u64 {
        self.safety_margin
    }

    /// Bytes needed to fetch a package of `package_bytes`
    pub fn required_for(&self, package_bytes: u64) -> u64 {
        package_bytes.saturating_add(self.safety_margin)
    }

    /// Whether `required_bytes` are free right now
    ///
    /// A failing probe counts as "no space".
    pub fn has_free_space(&self, required_bytes: u64) -> bool {
        if !self.enabled {
            return true;
        }
        match self.probe.free_bytes(&self.volume) {
            Ok(available) => available >= required_bytes,
            Err(e) => {
                tracing::warn!(
                    volume = %self.volume.display(),
                    error = %e,
                    "free space probe failed"
                );
                false
            }
        }
    }

    /// Check that a package of `package_bytes` plus the safety margin fits
    pub fn check(&self, package_bytes: u64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let required = self.required_for(package_bytes);
        let available = self.probe.free_bytes(&self.volume).map_err(|e| {
            Error::DiskSpaceCheckFailed(format!(
                "Failed to check disk space for '{}': {}",
                self.volume.display(),
                e
            ))
        })?;

        if available < required {
            tracing::info!(required, available, "not enough free space for download");
            return Err(DownloadError::InsufficientSpace {
                required,
                available,
            }
            .into());
        }
        Ok(())
    }
}

/// Probe with a settable answer, for tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FixedSpaceProbe {
    free: std::sync::atomic::AtomicU64,
    fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FixedSpaceProbe {
    pub(crate) fn new(free: u64) -> Self {
        let probe = Self::default();
        probe.set(free);
        probe
    }

    pub(crate) fn set(&self, free: u64) {
        self.free.store(free, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl FreeSpaceProbe for FixedSpaceProbe {
    fn free_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(std::io::Error::other("probe offline"));
        }
        Ok(self.free.load(std::sync::atomic::Ordering::SeqCst))
    }
}
