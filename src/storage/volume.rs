//! Volume management

use super::Usage;
use crate::compose::topology::VolumeSpec;
use crate::error::{BerthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// A named volume known to the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name as declared in the topology
    pub name: String,
    /// Mount point on host
    pub mountpoint: PathBuf,
    /// Default mount target inside services
    pub target: Option<String>,
    /// Whether the volume is managed outside berth
    pub external: bool,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl Volume {
    /// Get size in bytes
    pub fn size(&self) -> Result<u64> {
        if !self.mountpoint.exists() {
            return Ok(0);
        }

        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&self.mountpoint)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if let Ok(metadata) = entry.metadata() {
                if metadata.is_file() {
                    total += metadata.len();
                }
            }
        }

        Ok(total)
    }
}

/// Handle returned by [`VolumeManager::ensure`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pub name: String,
    pub mountpoint: PathBuf,
}

struct VolumeEntry {
    volume: Volume,
    usage: Mutex<Usage>,
}

impl VolumeEntry {
    fn usage(&self) -> Result<std::sync::MutexGuard<'_, Usage>> {
        self.usage
            .lock()
            .map_err(|_| BerthError::Lock(format!("Failed to lock volume {}", self.volume.name)))
    }
}

/// Volume manager
///
/// The map lock is only taken for writing when a volume is first registered
/// or removed; reference counts live behind one mutex per volume.
pub struct VolumeManager {
    /// Volumes indexed by name
    volumes: RwLock<HashMap<String, Arc<VolumeEntry>>>,
    /// Base path for volume storage
    base_path: PathBuf,
    /// Prefix for volumes created by berth
    project: String,
}

impl VolumeManager {
    /// Create a new volume manager
    pub fn new(base_path: PathBuf, project: &str) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;

        Ok(Self {
            volumes: RwLock::new(HashMap::new()),
            base_path,
            project: project.to_string(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn mountpoint(&self, spec: &VolumeSpec) -> PathBuf {
        if spec.external {
            self.base_path.join(spec.host_name())
        } else {
            self.base_path
                .join(format!("{}_{}", self.project, spec.host_name()))
        }
    }

    fn entry(&self, name: &str) -> Result<Arc<VolumeEntry>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;

        volumes
            .get(name)
            .cloned()
            .ok_or_else(|| BerthError::VolumeNotFound(name.to_string()))
    }

    /// Make sure a volume exists, creating it if needed. Idempotent.
    ///
    /// External volumes are never created; their directory must already be
    /// present under the base path.
    pub fn ensure(&self, spec: &VolumeSpec) -> Result<VolumeHandle> {
        if let Ok(entry) = self.entry(&spec.name) {
            return Ok(VolumeHandle {
                name: spec.name.clone(),
                mountpoint: entry.volume.mountpoint.clone(),
            });
        }

        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;

        if let Some(entry) = volumes.get(&spec.name) {
            return Ok(VolumeHandle {
                name: spec.name.clone(),
                mountpoint: entry.volume.mountpoint.clone(),
            });
        }

        let mountpoint = self.mountpoint(spec);
        if spec.external {
            if !mountpoint.is_dir() {
                return Err(BerthError::VolumeNotFound(format!(
                    "external volume {} ({})",
                    spec.name,
                    mountpoint.display()
                )));
            }
            debug!("Using external volume {} at {}", spec.name, mountpoint.display());
        } else if !mountpoint.exists() {
            std::fs::create_dir_all(&mountpoint)?;
            info!("Created volume {} at {}", spec.name, mountpoint.display());
        }

        let volume = Volume {
            name: spec.name.clone(),
            mountpoint: mountpoint.clone(),
            target: spec.target.clone(),
            external: spec.external,
            created_at: Utc::now(),
        };

        volumes.insert(
            spec.name.clone(),
            Arc::new(VolumeEntry {
                volume,
                usage: Mutex::new(Usage::default()),
            }),
        );

        Ok(VolumeHandle {
            name: spec.name.clone(),
            mountpoint,
        })
    }

    /// Get a volume by name
    pub fn get(&self, name: &str) -> Result<Volume> {
        Ok(self.entry(name)?.volume.clone())
    }

    /// List all volumes
    pub fn list(&self) -> Result<Vec<Volume>> {
        let volumes = self
            .volumes
            .read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;

        let mut list: Vec<Volume> = volumes.values().map(|e| e.volume.clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// Current reference count of a volume
    pub fn ref_count(&self, name: &str) -> Result<usize> {
        let entry = self.entry(name)?;
        let usage = entry.usage()?;
        Ok(usage.count())
    }

    /// Record that `holder` uses the volume; returns the new count
    pub fn add_reference(&self, name: &str, holder: &str) -> Result<usize> {
        let entry = self.entry(name)?;
        let mut usage = entry.usage()?;
        Ok(usage.acquire(holder))
    }

    /// Drop the reference held by `holder`; returns the new count
    pub fn remove_reference(&self, name: &str, holder: &str) -> Result<usize> {
        let entry = self.entry(name)?;
        let mut usage = entry.usage()?;
        if !usage.holds(holder) {
            warn!("Volume {} was not referenced by {}", name, holder);
        }
        Ok(usage.release(holder))
    }

    /// Remove a volume. Fails while the volume is referenced unless forced.
    /// External volumes are forgotten but never deleted from disk.
    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;

        let entry = volumes
            .get(name)
            .cloned()
            .ok_or_else(|| BerthError::VolumeNotFound(name.to_string()))?;

        {
            let usage = entry.usage()?;
            if usage.count() > 0 && !force {
                return Err(BerthError::Volume(format!(
                    "Volume {} is in use by {}",
                    name,
                    usage.holders().join(", ")
                )));
            }
        }

        if !entry.volume.external && entry.volume.mountpoint.exists() {
            std::fs::remove_dir_all(&entry.volume.mountpoint)?;
            info!("Removed volume {}", name);
        }

        volumes.remove(name);

        Ok(())
    }

    /// Remove every volume with no references. External volumes are only
    /// forgotten and are not part of the returned names.
    pub fn prune(&self) -> Result<Vec<String>> {
        let candidates: Vec<(String, bool)> = {
            let volumes = self
                .volumes
                .read()
                .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;
            volumes
                .iter()
                .map(|(name, entry)| (name.clone(), entry.volume.external))
                .collect()
        };

        let mut removed = Vec::new();
        for (name, external) in candidates {
            match self.remove(&name, false) {
                Ok(()) if external => {}
                Ok(()) => removed.push(name),
                Err(BerthError::Volume(reason)) => debug!("Keeping volume: {}", reason),
                Err(BerthError::VolumeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        removed.sort();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(name: &str) -> VolumeSpec {
        VolumeSpec {
            name: name.to_string(),
            external: false,
            host_name: None,
            target: None,
        }
    }

    #[test]
    fn test_ensure_volume_is_idempotent() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf(), "proj").unwrap();

        let first = manager.ensure(&spec("data")).unwrap();
        let second = manager.ensure(&spec("data")).unwrap();
        assert_eq!(first, second);
        assert!(first.mountpoint.ends_with("proj_data"));
        assert!(first.mountpoint.exists());
        assert_eq!(manager.list().unwrap().len(), 1);
    }

    #[test]
    fn test_external_volume_must_exist() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf(), "proj").unwrap();
        let mut external = spec("shared");
        external.external = true;

        assert!(matches!(
            manager.ensure(&external),
            Err(BerthError::VolumeNotFound(_))
        ));

        std::fs::create_dir_all(temp.path().join("shared")).unwrap();
        let handle = manager.ensure(&external).unwrap();
        assert_eq!(handle.mountpoint, temp.path().join("shared"));
    }

    #[test]
    fn test_remove_volume() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf(), "proj").unwrap();

        let handle = manager.ensure(&spec("test-volume")).unwrap();
        manager.remove("test-volume", false).unwrap();

        assert!(manager.get("test-volume").is_err());
        assert!(!handle.mountpoint.exists());
    }

    #[test]
    fn test_volume_reference_counting() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf(), "proj").unwrap();
        manager.ensure(&spec("test-volume")).unwrap();

        assert_eq!(manager.add_reference("test-volume", "a").unwrap(), 1);
        assert_eq!(manager.add_reference("test-volume", "b").unwrap(), 2);
        // same holder twice does not double count
        assert_eq!(manager.add_reference("test-volume", "b").unwrap(), 2);

        assert!(manager.remove("test-volume", false).is_err());

        assert_eq!(manager.remove_reference("test-volume", "a").unwrap(), 1);
        assert_eq!(manager.remove_reference("test-volume", "a").unwrap(), 1);
        assert_eq!(manager.remove_reference("test-volume", "b").unwrap(), 0);
        assert_eq!(manager.remove_reference("test-volume", "b").unwrap(), 0);

        manager.remove("test-volume", false).unwrap();
    }

    #[test]
    fn test_prune_keeps_referenced_volumes() {
        let temp = tempdir().unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf(), "proj").unwrap();
        manager.ensure(&spec("used")).unwrap();
        manager.ensure(&spec("unused")).unwrap();
        manager.add_reference("used", "svc").unwrap();

        assert_eq!(manager.prune().unwrap(), vec!["unused".to_string()]);
        assert!(manager.get("used").is_ok());
    }

    #[test]
    fn test_prune_leaves_external_volumes_alone() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("shared")).unwrap();
        let manager = VolumeManager::new(temp.path().to_path_buf(), "proj").unwrap();
        manager
            .ensure(&VolumeSpec {
                external: true,
                ..spec("shared")
            })
            .unwrap();
        manager.ensure(&spec("scratch")).unwrap();

        assert_eq!(manager.prune().unwrap(), vec!["scratch".to_string()]);
        assert!(temp.path().join("shared").exists());
    }

    #[test]
    fn test_concurrent_references_are_not_lost() {
        let temp = tempdir().unwrap();
        let manager = Arc::new(VolumeManager::new(temp.path().to_path_buf(), "proj").unwrap());
        manager.ensure(&spec("data")).unwrap();

        let threads: Vec<_> = (0..16)
            .map(|i| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    let holder = format!("svc-{}", i);
                    manager.add_reference("data", &holder).unwrap();
                    if i % 2 == 0 {
                        manager.remove_reference("data", &holder).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(manager.ref_count("data").unwrap(), 8);
    }
}
