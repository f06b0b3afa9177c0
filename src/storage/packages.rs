use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::RegionCatalog;
use crate::error::Result;
use crate::types::{PackageComponent, PackageOptions, RegionIndex};

const PARTIAL_EXTENSION: &str = "download";
const QUEUE_FORMAT_VERSION: u32 = 1;

/// A package found on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPackage {
    /// Data version (name of the folder holding the files)
    pub version: i64,
    /// Components present
    pub options: PackageOptions,
    /// Bytes used by all components
    pub size_bytes: u64,
}

/// One persisted download queue entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Catalog id of the leaf
    pub id: String,
    /// Requested components
    pub options: PackageOptions,
    /// Whether the request replaces a stale package
    #[serde(default)]
    pub is_update: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    format: u32,
    entries: Vec<QueueEntry>,
}

/// File layout of downloaded packages
///
/// ```text
/// <data_dir>/<version>/<id>.mwm
/// <data_dir>/<version>/<id>.mwm.routing
/// <data_dir>/<version>/<id>.mwm.<generation>.download   (in progress)
/// <data_dir>/download_queue.json
/// ```
#[derive(Clone, Debug)]
pub struct PackageStore {
    data_dir: PathBuf,
}

impl PackageStore {
    /// Store rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Root directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Final location of a package component
    pub fn package_path(&self, version: i64, id: &str, component: PackageComponent) -> PathBuf {
        self.data_dir
            .join(version.to_string())
            .join(component.file_name(id))
    }

    /// Location a transport writes a component to while fetching it
    ///
    /// The generation keeps concurrent writers of the same region apart (an aborted
    /// transfer may still be flushing while a new one starts).
    pub fn partial_path(
        &self,
        version: i64,
        id: &str,
        component: PackageComponent,
        generation: u64,
    ) -> PathBuf {
        let mut name = component.file_name(id);
        name.push_str(&format!(".{generation}.{PARTIAL_EXTENSION}"));
        self.data_dir.join(version.to_string()).join(name)
    }

    /// Remove every component of a package; missing files are fine
    pub fn delete_package(&self, id: &str, package: &LocalPackage) -> std::io::Result<()> {
        for component in PackageOptions::MapWithRouting.components() {
            remove_if_exists(&self.package_path(package.version, id, *component))?;
        }
        // Drop the version folder once it is empty; failure here is harmless
        std::fs::remove_dir(self.data_dir.join(package.version.to_string())).ok();
        tracing::info!(region = id, version = package.version, "package deleted");
        Ok(())
    }

    /// Remove partial files of one transfer, logging instead of failing
    pub fn discard_partials(&self, version: i64, id: &str, generation: u64) {
        for component in PackageOptions::MapWithRouting.components() {
            let path = self.partial_path(version, id, *component, generation);
            if let Err(e) = remove_if_exists(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove partial file");
            }
        }
    }

    /// Move finished partial files into place
    pub fn promote(
        &self,
        version: i64,
        id: &str,
        options: PackageOptions,
        generation: u64,
    ) -> std::io::Result<LocalPackage> {
        let mut size_bytes = 0;
        for component in options.components() {
            let partial = self.partial_path(version, id, *component, generation);
            let target = self.package_path(version, id, *component);
            std::fs::rename(&partial, &target)?;
            size_bytes += std::fs::metadata(&target)?.len();
        }
        Ok(LocalPackage {
            version,
            options,
            size_bytes,
        })
    }

    /// Find installed packages for the catalog's leaves
    ///
    /// Stale partial files are removed. When a region is present in several
    /// versions the newest is kept and the older copies are deleted.
    pub async fn scan(
        &self,
        catalog: &RegionCatalog,
    ) -> std::io::Result<HashMap<RegionIndex, LocalPackage>> {
        let mut found: HashMap<RegionIndex, LocalPackage> = HashMap::new();

        let mut versions = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e),
        };

        let mut version_dirs = Vec::new();
        while let Some(entry) = versions.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(version) = entry.file_name().to_str().and_then(|s| s.parse::<i64>().ok())
            {
                version_dirs.push((version, entry.path()));
            }
        }
        // Newest first so older copies can be recognised and dropped
        version_dirs.sort_by(|a, b| b.0.cmp(&a.0));

        for (version, dir) in version_dirs {
            for (id, package) in self.scan_version(version, &dir).await? {
                let Some(index) = catalog.find_by_id(&id) else {
                    tracing::debug!(region = %id, version, "package not in catalog, ignoring");
                    continue;
                };
                if catalog.get(index).is_some_and(|n| n.has_children()) {
                    continue;
                }
                if found.contains_key(&index) {
                    tracing::info!(region = %id, version, "removing superseded package");
                    if let Err(e) = self.delete_package(&id, &package) {
                        tracing::warn!(region = %id, version, error = %e, "failed to remove superseded package");
                    }
                    continue;
                }
                found.insert(index, package);
            }
        }

        tracing::info!(
            data_dir = %self.data_dir.display(),
            packages = found.len(),
            "local packages scanned"
        );
        Ok(found)
    }

    async fn scan_version(
        &self,
        version: i64,
        dir: &Path,
    ) -> std::io::Result<Vec<(String, LocalPackage)>> {
        let map_ext = PackageComponent::Map.extension();
        let routing_ext = PackageComponent::Routing.extension();

        let mut maps: HashMap<String, u64> = HashMap::new();
        let mut routing: HashMap<String, u64> = HashMap::new();

        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            if name.ends_with(&format!(".{PARTIAL_EXTENSION}")) {
                tracing::debug!(file = name, "removing stale partial file");
                tokio::fs::remove_file(entry.path()).await.ok();
                continue;
            }

            let size = entry.metadata().await?.len();
            if let Some(id) = name.strip_suffix(routing_ext) {
                routing.insert(id.to_string(), size);
            } else if let Some(id) = name.strip_suffix(map_ext) {
                maps.insert(id.to_string(), size);
            }
        }

        let packages = maps
            .into_iter()
            .map(|(id, map_size)| {
                let routing_size = routing.get(&id).copied();
                let package = LocalPackage {
                    version,
                    options: if routing_size.is_some() {
                        PackageOptions::MapWithRouting
                    } else {
                        PackageOptions::MapOnly
                    },
                    size_bytes: map_size + routing_size.unwrap_or(0),
                };
                (id, package)
            })
            .collect();
        Ok(packages)
    }

    /// Path of the persisted queue
    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join(crate::config::QUEUE_FILE_NAME)
    }

    /// Persist the queue, replacing the previous file atomically
    pub fn save_queue(&self, entries: &[QueueEntry]) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let file = QueueFile {
            format: QUEUE_FORMAT_VERSION,
            entries: entries.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let path = self.queue_path();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        tracing::debug!(entries = entries.len(), "download queue saved");
        Ok(())
    }

    /// Read the persisted queue; a missing file is an empty queue
    pub async fn load_queue(&self) -> Result<Vec<QueueEntry>> {
        match tokio::fs::read(self.queue_path()).await {
            Ok(raw) => {
                let file: QueueFile = serde_json::from_slice(&raw)?;
                Ok(file.entries)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
