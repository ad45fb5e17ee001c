//! Tenant configuration store.
//!
//! Scans a directory of `<tenant>.toml` files at startup. Lookup is by
//! dialed number (DID). The store is immutable after load; a config
//! change means a server restart.

use super::TenantConfig;
use crate::error::ConfigError;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ConfigStore {
    tenants: HashMap<String, Arc<TenantConfig>>,
    /// dialed number → tenant id
    number_index: HashMap<String, String>,
}

impl ConfigStore {
    /// Load every `*.toml` in `dir`. Files that fail to parse or validate
    /// are rejected loudly — a half-configured tenant answering calls is
    /// worse than a startup failure.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let mut tenants = HashMap::new();
        let mut number_index = HashMap::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            let config: TenantConfig = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            config.validate()?;

            for number in &config.numbers {
                if let Some(existing) = number_index.insert(number.clone(), config.tenant_id.clone()) {
                    warn!(
                        "number {} claimed by both {} and {} — keeping {}",
                        number, existing, config.tenant_id, config.tenant_id
                    );
                }
            }
            info!(
                "loaded tenant {} ({} numbers, {} destinations)",
                config.tenant_id,
                config.numbers.len(),
                config.destinations.len()
            );
            tenants.insert(config.tenant_id.clone(), Arc::new(config));
        }

        if tenants.is_empty() {
            warn!("no tenant configs found in {}", dir.display());
        }
        Ok(Self { tenants, number_index })
    }

    pub fn by_tenant_id(&self, tenant_id: &str) -> Option<Arc<TenantConfig>> {
        self.tenants.get(tenant_id).cloned()
    }

    /// Resolve the tenant for an inbound call by its dialed number.
    pub fn by_number(&self, number: &str) -> Result<Arc<TenantConfig>, ConfigError> {
        self.number_index
            .get(number)
            .and_then(|id| self.tenants.get(id))
            .cloned()
            .ok_or_else(|| ConfigError::UnknownTenant(number.to_string()))
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACME_TOML: &str = r#"
tenant_id = "acme"
numbers = ["+15551234567"]
record_sink_url = "http://localhost:9000/records"

[secretary]
secretary_id = "front-desk"
instructions = "You are the virtual secretary for Acme."
greeting = "Thank you for calling Acme, how can I help?"
voice = "alloy"

[secretary.vad]
mode = "server_vad"
threshold = 0.6

[[destinations]]
name = "Sales"
aliases = ["sales team"]
kind = "extension"
address = "1001"
default = true

[business_info]
hours = "Mon-Fri 9-17"
website = "acme.example"
"#;

    #[test]
    fn test_load_dir_parses_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("acme.toml"), ACME_TOML).unwrap();

        let store = ConfigStore::load_dir(dir.path()).unwrap();
        assert_eq!(store.tenant_count(), 1);

        let tenant = store.by_number("+15551234567").unwrap();
        assert_eq!(tenant.tenant_id, "acme");
        assert_eq!(tenant.secretary.voice, "alloy");
        assert_eq!(tenant.destinations[0].address, "1001");
        assert_eq!(tenant.business_info.get("hours").unwrap(), "Mon-Fri 9-17");

        assert!(store.by_number("+15550000000").is_err());
    }

    #[test]
    fn test_invalid_address_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let bad = ACME_TOML.replace("address = \"1001\"", "address = \"not-a-number\"");
        std::fs::write(dir.path().join("acme.toml"), bad).unwrap();
        assert!(ConfigStore::load_dir(dir.path()).is_err());
    }

    #[test]
    fn test_non_toml_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("readme.txt"), "hello").unwrap();
        let store = ConfigStore::load_dir(dir.path()).unwrap();
        assert_eq!(store.tenant_count(), 0);
    }
}
