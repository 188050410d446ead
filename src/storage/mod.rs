//! Resource management
//!
//! Named volumes and secrets shared between services. A resource is created
//! (or looked up) once and reference counted per holding service; it can only
//! be removed once nobody holds it.

pub mod secret;
pub mod volume;

pub use secret::{
    ChainSecretProvider, DirectorySecretProvider, EnvSecretProvider, SecretHandle, SecretManager,
    SecretProvider, SecretValue, StaticSecretProvider,
};
pub use volume::{Volume, VolumeHandle, VolumeManager};

use crate::compose::topology::{Service, Topology};
use crate::error::{BerthError, Result};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Holders of a single resource
///
/// Holders are service names, so acquiring twice for the same service does
/// not double count and releasing a holder that is absent is a no-op. The
/// count can never go below zero.
#[derive(Debug, Default, Clone)]
pub struct Usage {
    holders: BTreeSet<String>,
}

impl Usage {
    pub fn acquire(&mut self, holder: &str) -> usize {
        self.holders.insert(holder.to_string());
        self.holders.len()
    }

    pub fn release(&mut self, holder: &str) -> usize {
        self.holders.remove(holder);
        self.holders.len()
    }

    pub fn holds(&self, holder: &str) -> bool {
        self.holders.contains(holder)
    }

    pub fn count(&self) -> usize {
        self.holders.len()
    }

    pub fn holders(&self) -> Vec<String> {
        self.holders.iter().cloned().collect()
    }
}

/// Resources handed to a starting service
#[derive(Debug, Clone, Default)]
pub struct Acquired {
    pub volumes: Vec<VolumeHandle>,
    pub secrets: Vec<SecretHandle>,
}

impl Acquired {
    pub fn volume(&self, name: &str) -> Option<&VolumeHandle> {
        self.volumes.iter().find(|v| v.name == name)
    }

    pub fn secret(&self, name: &str) -> Option<&SecretHandle> {
        self.secrets.iter().find(|s| s.name == name)
    }
}

/// Volumes and secrets of one project
pub struct ResourceManager {
    volumes: VolumeManager,
    secrets: SecretManager,
}

impl ResourceManager {
    pub fn new(volumes: VolumeManager, secrets: SecretManager) -> Self {
        Self { volumes, secrets }
    }

    pub fn volumes(&self) -> &VolumeManager {
        &self.volumes
    }

    pub fn secrets(&self) -> &SecretManager {
        &self.secrets
    }

    /// Resolve every declared secret, then every declared volume.
    ///
    /// Runs before any service starts so that a missing external secret or
    /// volume aborts the whole startup.
    pub fn prepare(&self, topology: &Topology) -> Result<()> {
        for spec in topology.secrets().values() {
            self.secrets.ensure(spec)?;
        }
        for spec in topology.volumes().values() {
            self.volumes.ensure(spec)?;
        }
        info!(
            "Prepared {} volume(s) and {} secret(s)",
            topology.volumes().len(),
            topology.secrets().len()
        );
        Ok(())
    }

    /// Take a reference on every volume and secret the service uses.
    ///
    /// On failure the references taken so far are dropped again.
    pub fn acquire(&self, topology: &Topology, service: &Service) -> Result<Acquired> {
        let mut acquired = Acquired::default();

        let result = self.acquire_into(topology, service, &mut acquired);
        if let Err(e) = result {
            self.release_acquired(&service.name, &acquired);
            return Err(e);
        }

        Ok(acquired)
    }

    fn acquire_into(
        &self,
        topology: &Topology,
        service: &Service,
        acquired: &mut Acquired,
    ) -> Result<()> {
        for name in service.volume_names() {
            let spec = topology
                .volumes()
                .get(name)
                .ok_or_else(|| BerthError::VolumeNotFound(name.to_string()))?;
            let handle = self.volumes.ensure(spec)?;
            let count = self.volumes.add_reference(name, &service.name)?;
            debug!("Volume {} now held by {} service(s)", name, count);
            acquired.volumes.push(handle);
        }

        for name in service.secret_names() {
            let spec = topology
                .secrets()
                .get(name)
                .ok_or_else(|| BerthError::Secret(format!("Secret {} is not declared", name)))?;
            let handle = self.secrets.ensure(spec)?;
            self.secrets.add_reference(name, &service.name)?;
            acquired.secrets.push(handle);
        }

        Ok(())
    }

    fn release_acquired(&self, holder: &str, acquired: &Acquired) {
        for volume in &acquired.volumes {
            if let Err(e) = self.volumes.remove_reference(&volume.name, holder) {
                warn!("Failed to release volume {}: {}", volume.name, e);
            }
        }
        for secret in &acquired.secrets {
            if let Err(e) = self.secrets.remove_reference(&secret.name, holder) {
                warn!("Failed to release secret {}: {}", secret.name, e);
            }
        }
    }

    /// Drop the service's references. Resources the service never acquired
    /// are skipped.
    pub fn release(&self, service: &Service) -> Result<()> {
        for name in service.volume_names() {
            match self.volumes.remove_reference(name, &service.name) {
                Ok(count) => debug!("Volume {} now held by {} service(s)", name, count),
                Err(BerthError::VolumeNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        for name in service.secret_names() {
            match self.secrets.remove_reference(name, &service.name) {
                Ok(_) | Err(BerthError::Secret(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Register the project's own volumes, e.g. so that an invocation that
    /// did not start the services can remove them
    pub fn adopt_volumes(&self, topology: &Topology) -> Result<usize> {
        let mut adopted = 0;
        for spec in topology.volumes().values().filter(|v| !v.external) {
            self.volumes.ensure(spec)?;
            adopted += 1;
        }
        Ok(adopted)
    }

    /// Remove every unreferenced volume created by berth
    pub fn remove_unused_volumes(&self) -> Result<Vec<String>> {
        let removed = self.volumes.prune()?;
        for name in &removed {
            info!("Removed unused volume {}", name);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeParser;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn manager(dir: &Path, provider: StaticSecretProvider) -> ResourceManager {
        ResourceManager::new(
            VolumeManager::new(dir.join("volumes"), "proj").unwrap(),
            SecretManager::new(Arc::new(provider), dir.join("secrets"), dir.to_path_buf()),
        )
    }

    fn topology(yaml: &str) -> Topology {
        Topology::load(&ComposeParser::parse_str(yaml).unwrap()).unwrap()
    }

    const SHARED: &str = r#"
services:
  influxdb:
    image: influxdb
    volumes:
      - influx-data:/var/lib/influxdb
    secrets:
      - influx_password
  grafana:
    image: grafana/grafana
    volumes:
      - influx-data:/data:ro
volumes:
  influx-data:
secrets:
  influx_password:
    external: true
"#;

    #[test]
    fn test_usage_never_goes_negative() {
        let mut usage = Usage::default();
        assert_eq!(usage.release("a"), 0);
        assert_eq!(usage.acquire("a"), 1);
        assert_eq!(usage.acquire("a"), 1);
        assert_eq!(usage.release("a"), 0);
        assert_eq!(usage.release("a"), 0);
    }

    #[test]
    fn test_prepare_fails_on_missing_external_secret() {
        let temp = tempdir().unwrap();
        let resources = manager(temp.path(), StaticSecretProvider::new());

        let err = resources.prepare(&topology(SHARED)).unwrap_err();
        assert!(matches!(err, BerthError::MissingExternalSecret(_)));
        // no volume was created before the failure
        assert!(resources.volumes().list().unwrap().is_empty());
    }

    #[test]
    fn test_shared_volume_is_removed_only_when_unreferenced() {
        let temp = tempdir().unwrap();
        let resources = manager(
            temp.path(),
            StaticSecretProvider::new().with("influx_password", "pw"),
        );
        let topology = topology(SHARED);
        resources.prepare(&topology).unwrap();

        let influx = topology.find("influxdb").unwrap();
        let grafana = topology.find("grafana").unwrap();

        let acquired = resources.acquire(&topology, influx).unwrap();
        assert!(acquired.volume("influx-data").is_some());
        assert_eq!(
            acquired.secret("influx_password").unwrap().value.expose(),
            "pw"
        );
        resources.acquire(&topology, grafana).unwrap();
        assert_eq!(resources.volumes().ref_count("influx-data").unwrap(), 2);

        resources.release(influx).unwrap();
        assert!(resources.remove_unused_volumes().unwrap().is_empty());

        resources.release(grafana).unwrap();
        assert_eq!(
            resources.remove_unused_volumes().unwrap(),
            vec!["influx-data".to_string()]
        );
    }

    #[test]
    fn test_release_without_acquire_is_harmless() {
        let temp = tempdir().unwrap();
        let resources = manager(
            temp.path(),
            StaticSecretProvider::new().with("influx_password", "pw"),
        );
        let topology = topology(SHARED);

        resources.release(topology.find("grafana").unwrap()).unwrap();
        resources.prepare(&topology).unwrap();
        resources.release(topology.find("grafana").unwrap()).unwrap();
        assert_eq!(resources.volumes().ref_count("influx-data").unwrap(), 0);
    }

    #[test]
    fn test_failed_acquire_rolls_back() {
        let temp = tempdir().unwrap();
        let resources = manager(temp.path(), StaticSecretProvider::new());
        let topology = topology(SHARED);

        let influx = topology.find("influxdb").unwrap();
        assert!(resources.acquire(&topology, influx).is_err());
        assert_eq!(resources.volumes().ref_count("influx-data").unwrap(), 0);
    }
}
