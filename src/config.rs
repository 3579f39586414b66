//! Adapter Configuration
//!
//! YAML configuration file model. The array section configures the REST
//! gateway; the remaining sections shape how attachments are carried out.
//!
//! ```yaml
//! array:
//!   address: 10.0.0.20
//!   username: Local/admin
//!   password: secret
//! protocol: fc
//! io_ports: ["spa_iom_0_fc*", "spb_iom_0_fc*"]
//! zoning:
//!   fabrics:
//!     fabric_a:
//!       initiators: ["10000090fa0d6754"]
//!       targets: ["5006016036e00e5a"]
//! host_lock: auto
//! dummy_lun:
//!   pool_id: pool_1
//! ```

use crate::domain::model::Protocol;
use crate::error::{Error, Result};
use crate::gateway::unity::UnityConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Name of the LUN occupying HLU 0 on fresh hosts
pub const DEFAULT_DUMMY_LUN_NAME: &str = "openstack_dummy_lun";
/// 1 GiB
pub const DEFAULT_DUMMY_LUN_SIZE: u64 = 1024 * 1024 * 1024;

/// When exposure is serialized per host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostLockMode {
    /// Lock only for Fibre Channel with zoning configured
    #[default]
    Auto,
    Always,
    Never,
}

impl HostLockMode {
    pub fn enabled(&self, protocol: Protocol, zoning: bool) -> bool {
        match self {
            HostLockMode::Auto => protocol == Protocol::Fc && zoning,
            HostLockMode::Always => true,
            HostLockMode::Never => false,
        }
    }
}

/// LUN exposed first to a host without mappings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DummyLunConfig {
    pub pool_id: String,
    #[serde(default = "default_dummy_name")]
    pub name: String,
    #[serde(default = "default_dummy_size")]
    pub size_bytes: u64,
}

fn default_dummy_name() -> String {
    DEFAULT_DUMMY_LUN_NAME.to_string()
}

fn default_dummy_size() -> u64 {
    DEFAULT_DUMMY_LUN_SIZE
}

/// Initiators and targets zoned together on one fabric
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FabricConfig {
    #[serde(default)]
    pub initiators: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ZoningConfig {
    #[serde(default)]
    pub fabrics: BTreeMap<String, FabricConfig>,
}

/// Top-level adapter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    #[serde(default)]
    pub array: UnityConfig,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    /// Enables zone lookups for Fibre Channel
    #[serde(default)]
    pub zoning: Option<ZoningConfig>,
    /// Glob patterns restricting the usable target ports
    #[serde(default)]
    pub io_ports: Vec<String>,
    #[serde(default)]
    pub host_lock: HostLockMode,
    #[serde(default)]
    pub dummy_lun: Option<DummyLunConfig>,
    #[serde(default)]
    pub target_seed: Option<u64>,
}

fn default_protocol() -> Protocol {
    Protocol::Iscsi
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            array: UnityConfig::default(),
            protocol: default_protocol(),
            zoning: None,
            io_ports: Vec::new(),
            host_lock: HostLockMode::default(),
            dummy_lun: None,
            target_seed: None,
        }
    }
}

impl AdapterConfig {
    /// Read and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::read(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML configuration file without validating it
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: AdapterConfig = serde_yaml::from_str(&raw)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Check settings that are only meaningful against a real array
    pub fn validate(&self) -> Result<()> {
        if self.array.address.trim().is_empty() {
            return Err(Error::Configuration("array.address must be set".into()));
        }
        self.validate_attachment()
    }

    /// Check settings shared by every gateway
    pub fn validate_attachment(&self) -> Result<()> {
        if let Some(pattern) = self.io_ports.iter().find(|p| p.trim().is_empty()) {
            return Err(Error::Configuration(format!(
                "io_ports contains an empty pattern: {:?}",
                pattern
            )));
        }
        for pattern in &self.io_ports {
            glob::Pattern::new(pattern).map_err(|e| {
                Error::Configuration(format!("invalid io_ports pattern {}: {}", pattern, e))
            })?;
        }
        if let Some(dummy) = &self.dummy_lun {
            if dummy.size_bytes == 0 {
                return Err(Error::Configuration("dummy_lun.size_bytes must be positive".into()));
            }
            if dummy.pool_id.is_empty() {
                return Err(Error::Configuration("dummy_lun.pool_id must be set".into()));
            }
        }
        Ok(())
    }

    pub fn zoning_enabled(&self) -> bool {
        self.protocol == Protocol::Fc && self.zoning.is_some()
    }

    pub fn host_lock_enabled(&self) -> bool {
        self.host_lock.enabled(self.protocol, self.zoning.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
array:
  address: 10.0.0.20
  username: Local/admin
  password: secret
  verify_tls: false
protocol: fc
io_ports: ["spa_*"]
zoning:
  fabrics:
    fabric_a:
      initiators: ["10000090fa0d6754"]
      targets: ["5006016036e00e5a"]
dummy_lun:
  pool_id: pool_1
target_seed: 42
"#,
        );

        let config = AdapterConfig::load(file.path()).unwrap();
        assert_eq!(config.protocol, Protocol::Fc);
        assert_eq!(config.array.port, 443);
        assert!(!config.array.verify_tls);
        assert_eq!(config.array.request_timeout_secs, 30);
        assert!(config.zoning_enabled());
        assert!(config.host_lock_enabled());
        let dummy = config.dummy_lun.unwrap();
        assert_eq!(dummy.name, DEFAULT_DUMMY_LUN_NAME);
        assert_eq!(dummy.size_bytes, DEFAULT_DUMMY_LUN_SIZE);
        assert_eq!(config.target_seed, Some(42));
    }

    #[test]
    fn test_minimal_config_defaults() {
        let file = write_config("array:\n  address: array.local\n");
        let config = AdapterConfig::load(file.path()).unwrap();
        assert_eq!(config.protocol, Protocol::Iscsi);
        assert_eq!(config.host_lock, HostLockMode::Auto);
        assert!(!config.host_lock_enabled());
        assert!(config.io_ports.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let config = AdapterConfig::default();
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = AdapterConfig::default();
        config.array.address = "array.local".into();
        config.io_ports = vec!["spa_*".into(), " ".into()];
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        config.io_ports.clear();
        config.dummy_lun = Some(DummyLunConfig {
            pool_id: "pool_1".into(),
            name: DEFAULT_DUMMY_LUN_NAME.into(),
            size_bytes: 0,
        });
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_host_lock_modes() {
        assert!(HostLockMode::Auto.enabled(Protocol::Fc, true));
        assert!(!HostLockMode::Auto.enabled(Protocol::Fc, false));
        assert!(!HostLockMode::Auto.enabled(Protocol::Iscsi, true));
        assert!(HostLockMode::Always.enabled(Protocol::Iscsi, false));
        assert!(!HostLockMode::Never.enabled(Protocol::Fc, true));
    }

    #[test]
    fn test_load_reports_yaml_errors() {
        let file = write_config("protocol: [not, a, protocol]\n");
        assert_matches!(AdapterConfig::load(file.path()), Err(Error::YamlParse(_)));
    }
}
