//! Secret store and credential binding
//!
//! Secrets are looked up by name only when the step that references them is
//! about to be invoked. Every value handed out is registered with the run's
//! [`SecretMask`] so it can be scrubbed from anything the engine reports.

use crate::core::{config::ConfigurationError, SecretResolver};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::debug;

const MASK: &str = "***";

/// An opaque credential value
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value; only for handing to the invoked action
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", MASK)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

/// Read-only, process-wide source of secrets
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Option<Secret>;
}

/// Secrets read from the process environment, optionally under a prefix
///
/// With prefix `SHIPYARD_SECRET_`, `secrets.CARGO_REGISTRY_TOKEN` reads
/// `SHIPYARD_SECRET_CARGO_REGISTRY_TOKEN`.
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl SecretStore for EnvSecretStore {
    fn get(&self, name: &str) -> Option<Secret> {
        std::env::var(format!("{}{}", self.prefix, name))
            .ok()
            .filter(|value| !value.is_empty())
            .map(Secret::new)
    }
}

/// In-memory secrets (for testing or embedding)
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    values: HashMap<String, Secret>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), Secret::new(value));
        self
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Option<Secret> {
        self.values.get(name).cloned()
    }
}

/// Values to scrub from logs, outputs and errors
#[derive(Debug, Default)]
pub struct SecretMask {
    values: Mutex<Vec<String>>,
}

impl SecretMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, secret: &Secret) {
        if secret.expose().is_empty() {
            return;
        }
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        if !values.iter().any(|v| v == secret.expose()) {
            values.push(secret.expose().to_string());
            // longest first, so a secret containing another is masked whole
            values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        }
    }

    /// Replace every registered value in `text`
    pub fn mask(&self, text: &str) -> String {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values
            .iter()
            .fold(text.to_string(), |masked, value| masked.replace(value.as_str(), MASK))
    }
}

/// Resolver binding a store to a mask for one step invocation
pub struct BoundSecrets<'a> {
    store: &'a dyn SecretStore,
    mask: &'a SecretMask,
}

impl<'a> BoundSecrets<'a> {
    pub fn new(store: &'a dyn SecretStore, mask: &'a SecretMask) -> Self {
        Self { store, mask }
    }
}

impl SecretResolver for BoundSecrets<'_> {
    fn resolve(&self, name: &str) -> Result<String, ConfigurationError> {
        let secret = self
            .store
            .get(name)
            .ok_or_else(|| ConfigurationError::MissingSecret(name.to_string()))?;
        self.mask.register(&secret);
        debug!("Bound secret {}", name);
        Ok(secret.expose().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_never_formats_its_value() {
        let secret = Secret::new("cio_abc123");
        assert_eq!(secret.to_string(), "***");
        assert!(!format!("{:?}", secret).contains("cio_abc123"));
        assert_eq!(secret.expose(), "cio_abc123");
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySecretStore::new().with_secret("TOKEN", "t0k3n");
        assert_eq!(store.get("TOKEN").unwrap().expose(), "t0k3n");
        assert!(store.get("OTHER").is_none());
    }

    #[test]
    fn test_env_store_with_prefix() {
        std::env::set_var("SHIPYARD_TEST_SECRET_PUBLISH", "from-env");
        let store = EnvSecretStore::with_prefix("SHIPYARD_TEST_SECRET_");
        assert_eq!(store.get("PUBLISH").unwrap().expose(), "from-env");
        assert!(store.get("ABSENT").is_none());
        std::env::remove_var("SHIPYARD_TEST_SECRET_PUBLISH");
    }

    #[test]
    fn test_mask_scrubs_registered_values() {
        let mask = SecretMask::new();
        mask.register(&Secret::new("abc"));
        mask.register(&Secret::new("abcdef"));
        assert_eq!(mask.mask("token=abcdef and abc"), "token=*** and ***");
        assert_eq!(mask.mask("nothing here"), "nothing here");
    }

    #[test]
    fn test_bound_secrets_register_on_lookup() {
        let store = MemorySecretStore::new().with_secret("TOKEN", "s3cr3t");
        let mask = SecretMask::new();
        let bound = BoundSecrets::new(&store, &mask);

        assert_eq!(bound.resolve("TOKEN").unwrap(), "s3cr3t");
        assert_eq!(mask.mask("publishing with s3cr3t"), "publishing with ***");
        assert_eq!(
            bound.resolve("MISSING"),
            Err(ConfigurationError::MissingSecret("MISSING".to_string()))
        );
    }
}
