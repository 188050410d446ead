//! Secret management
//!
//! External secrets are looked up through a [`SecretProvider`] and are never
//! created by berth. Internal secrets come from a file, an environment
//! variable, or a managed store where they start empty.

use super::Usage;
use crate::compose::topology::{Provenance, SecretSource, SecretSpec};
use crate::error::{BerthError, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Default prefix for secrets read from the environment
pub const DEFAULT_SECRET_PREFIX: &str = "BERTH_SECRET_";

/// Secret value; never printed
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue(<redacted>)")
    }
}

/// Source of external secrets
pub trait SecretProvider: Send + Sync {
    /// Short description used in log messages
    fn describe(&self) -> String;

    /// Look up a secret; `Ok(None)` when the provider does not have it
    fn lookup(&self, name: &str) -> Result<Option<SecretValue>>;
}

/// Reads `<prefix><NAME>` from the process environment, where `NAME` is the
/// secret name upper-cased with every non-alphanumeric character replaced by
/// an underscore
#[derive(Debug, Clone)]
pub struct EnvSecretProvider {
    prefix: String,
}

impl EnvSecretProvider {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Environment variable consulted for a secret
    pub fn variable(&self, name: &str) -> String {
        let key: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, key)
    }
}

impl Default for EnvSecretProvider {
    fn default() -> Self {
        Self::new(DEFAULT_SECRET_PREFIX)
    }
}

impl SecretProvider for EnvSecretProvider {
    fn describe(&self) -> String {
        format!("environment ({}*)", self.prefix)
    }

    fn lookup(&self, name: &str) -> Result<Option<SecretValue>> {
        Ok(std::env::var(self.variable(name)).ok().map(SecretValue))
    }
}

/// Reads `<dir>/<name>`, as mounted by secret stores
#[derive(Debug, Clone)]
pub struct DirectorySecretProvider {
    dir: PathBuf,
}

impl DirectorySecretProvider {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl SecretProvider for DirectorySecretProvider {
    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }

    fn lookup(&self, name: &str) -> Result<Option<SecretValue>> {
        let path = self.dir.join(name);
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(SecretValue(
            content.strip_suffix('\n').unwrap_or(&content).to_string(),
        )))
    }
}

/// In-memory provider
#[derive(Debug, Clone, Default)]
pub struct StaticSecretProvider {
    values: HashMap<String, SecretValue>,
}

impl StaticSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), SecretValue::new(value));
        self
    }
}

impl SecretProvider for StaticSecretProvider {
    fn describe(&self) -> String {
        "static".to_string()
    }

    fn lookup(&self, name: &str) -> Result<Option<SecretValue>> {
        Ok(self.values.get(name).cloned())
    }
}

/// Tries providers in order and returns the first hit
#[derive(Default)]
pub struct ChainSecretProvider {
    providers: Vec<Box<dyn SecretProvider>>,
}

impl ChainSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl SecretProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }
}

impl SecretProvider for ChainSecretProvider {
    fn describe(&self) -> String {
        self.providers
            .iter()
            .map(|p| p.describe())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn lookup(&self, name: &str) -> Result<Option<SecretValue>> {
        for provider in &self.providers {
            if let Some(value) = provider.lookup(name)? {
                debug!("Secret {} resolved from {}", name, provider.describe());
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

/// Resolved secret
#[derive(Debug, Clone)]
pub struct SecretHandle {
    pub name: String,
    pub provenance: Provenance,
    pub value: SecretValue,
}

struct SecretEntry {
    handle: SecretHandle,
    usage: Mutex<Usage>,
}

impl SecretEntry {
    fn usage(&self) -> Result<std::sync::MutexGuard<'_, Usage>> {
        self.usage
            .lock()
            .map_err(|_| BerthError::Lock(format!("Failed to lock secret {}", self.handle.name)))
    }
}

/// Secret manager
pub struct SecretManager {
    provider: Arc<dyn SecretProvider>,
    /// Store for managed internal secrets
    store_dir: PathBuf,
    /// Directory relative `file:` paths are resolved against
    base_dir: PathBuf,
    secrets: RwLock<HashMap<String, Arc<SecretEntry>>>,
}

impl SecretManager {
    pub fn new(provider: Arc<dyn SecretProvider>, store_dir: PathBuf, base_dir: PathBuf) -> Self {
        Self {
            provider,
            store_dir,
            base_dir,
            secrets: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, name: &str) -> Result<Arc<SecretEntry>> {
        let secrets = self
            .secrets
            .read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;

        secrets
            .get(name)
            .cloned()
            .ok_or_else(|| BerthError::Secret(format!("Secret {} has not been resolved", name)))
    }

    /// Resolve a secret. External secrets that the provider does not know
    /// fail with [`BerthError::MissingExternalSecret`].
    pub fn ensure(&self, spec: &SecretSpec) -> Result<SecretHandle> {
        if let Ok(entry) = self.entry(&spec.name) {
            return Ok(entry.handle.clone());
        }

        let value = self.resolve(spec)?;

        let mut secrets = self
            .secrets
            .write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;

        let entry = secrets.entry(spec.name.clone()).or_insert_with(|| {
            Arc::new(SecretEntry {
                handle: SecretHandle {
                    name: spec.name.clone(),
                    provenance: spec.provenance,
                    value,
                },
                usage: Mutex::new(Usage::default()),
            })
        });

        Ok(entry.handle.clone())
    }

    fn resolve(&self, spec: &SecretSpec) -> Result<SecretValue> {
        match (&spec.provenance, &spec.source) {
            (Provenance::External, SecretSource::Provider(key)) => {
                self.provider.lookup(key)?.ok_or_else(|| {
                    BerthError::MissingExternalSecret(format!(
                        "{} (looked up as '{}' in {})",
                        spec.name,
                        key,
                        self.provider.describe()
                    ))
                })
            }
            (Provenance::External, _) => Err(BerthError::Internal(format!(
                "external secret {} has no provider key",
                spec.name
            ))),
            (Provenance::Internal, SecretSource::File(path)) => {
                let path = self.base_dir.join(path);
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    BerthError::Secret(format!(
                        "Failed to read secret {} from {}: {}",
                        spec.name,
                        path.display(),
                        e
                    ))
                })?;
                Ok(SecretValue(content))
            }
            (Provenance::Internal, SecretSource::Environment(var)) => match std::env::var(var) {
                Ok(value) => Ok(SecretValue(value)),
                Err(_) => {
                    warn!(
                        "Environment variable {} for secret {} is not set; using an empty value",
                        var, spec.name
                    );
                    Ok(SecretValue::default())
                }
            },
            (Provenance::Internal, SecretSource::Managed) => self.managed(&spec.name),
            (Provenance::Internal, SecretSource::Provider(key)) => {
                Ok(self.provider.lookup(key)?.unwrap_or_default())
            }
        }
    }

    /// Managed secrets live in the store directory; a missing one is created
    /// empty so it can be filled in later.
    fn managed(&self, name: &str) -> Result<SecretValue> {
        let path = self.store_dir.join(name);
        if !path.exists() {
            std::fs::create_dir_all(&self.store_dir)?;
            write_private(&path, b"")?;
            info!("Created empty secret {} at {}", name, path.display());
        }
        Ok(SecretValue(std::fs::read_to_string(&path)?))
    }

    pub fn ref_count(&self, name: &str) -> Result<usize> {
        let entry = self.entry(name)?;
        let usage = entry.usage()?;
        Ok(usage.count())
    }

    pub fn add_reference(&self, name: &str, holder: &str) -> Result<usize> {
        let entry = self.entry(name)?;
        let mut usage = entry.usage()?;
        Ok(usage.acquire(holder))
    }

    pub fn remove_reference(&self, name: &str, holder: &str) -> Result<usize> {
        let entry = self.entry(name)?;
        let mut usage = entry.usage()?;
        if !usage.holds(holder) {
            warn!("Secret {} was not referenced by {}", name, holder);
        }
        Ok(usage.release(holder))
    }
}

/// Write a file readable only by the owner
pub(crate) fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn external(name: &str) -> SecretSpec {
        SecretSpec {
            name: name.to_string(),
            provenance: Provenance::External,
            source: SecretSource::Provider(name.to_string()),
        }
    }

    fn manager(provider: impl SecretProvider + 'static, dir: &Path) -> SecretManager {
        SecretManager::new(Arc::new(provider), dir.join("store"), dir.to_path_buf())
    }

    #[test]
    fn test_missing_external_secret_fails() {
        let temp = tempdir().unwrap();
        let secrets = manager(StaticSecretProvider::new(), temp.path());

        let err = secrets.ensure(&external("db_password")).unwrap_err();
        assert!(matches!(err, BerthError::MissingExternalSecret(_)));
        // nothing was created on the external's behalf
        assert!(!temp.path().join("store").join("db_password").exists());
    }

    #[test]
    fn test_external_secret_resolves_through_chain() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("api_key"), "from-dir\n").unwrap();

        let provider = ChainSecretProvider::new()
            .with(StaticSecretProvider::new().with("db_password", "hunter2"))
            .with(DirectorySecretProvider::new(temp.path().to_path_buf()));
        let secrets = manager(provider, temp.path());

        assert_eq!(
            secrets.ensure(&external("db_password")).unwrap().value.expose(),
            "hunter2"
        );
        assert_eq!(
            secrets.ensure(&external("api_key")).unwrap().value.expose(),
            "from-dir"
        );
    }

    #[test]
    fn test_managed_secret_is_created_empty() {
        let temp = tempdir().unwrap();
        let secrets = manager(StaticSecretProvider::new(), temp.path());
        let spec = SecretSpec {
            name: "token".to_string(),
            provenance: Provenance::Internal,
            source: SecretSource::Managed,
        };

        let handle = secrets.ensure(&spec).unwrap();
        assert!(handle.value.is_empty());
        assert!(temp.path().join("store").join("token").exists());
    }

    #[test]
    fn test_file_secret_is_read_relative_to_base() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("pw.txt"), "s3cret").unwrap();
        let secrets = manager(StaticSecretProvider::new(), temp.path());
        let spec = SecretSpec {
            name: "pw".to_string(),
            provenance: Provenance::Internal,
            source: SecretSource::File("pw.txt".to_string()),
        };

        assert_eq!(secrets.ensure(&spec).unwrap().value.expose(), "s3cret");
    }

    #[test]
    fn test_env_provider_variable_name() {
        let provider = EnvSecretProvider::default();
        assert_eq!(
            provider.variable("influxdb-admin.password"),
            "BERTH_SECRET_INFLUXDB_ADMIN_PASSWORD"
        );
    }

    #[test]
    fn test_secret_value_is_redacted() {
        let value = SecretValue::new("hunter2");
        assert!(!format!("{:?}", value).contains("hunter2"));
    }

    #[test]
    fn test_secret_reference_counting() {
        let temp = tempdir().unwrap();
        let secrets = manager(
            StaticSecretProvider::new().with("token", "t"),
            temp.path(),
        );
        secrets.ensure(&external("token")).unwrap();

        assert_eq!(secrets.add_reference("token", "a").unwrap(), 1);
        assert_eq!(secrets.add_reference("token", "b").unwrap(), 2);
        assert_eq!(secrets.remove_reference("token", "a").unwrap(), 1);
        assert_eq!(secrets.remove_reference("token", "a").unwrap(), 1);
        assert_eq!(secrets.remove_reference("token", "b").unwrap(), 0);
    }
}
