//! Fabric Zone Lookup
//!
//! [`StaticZoneLookup`] answers zone queries from the fabric map in the
//! adapter configuration. For each fabric it reports the requested initiators
//! and targets that are zoned on it; fabrics sharing nothing with the request
//! are left out.

use crate::config::ZoningConfig;
use crate::domain::model::{FabricMapping, ZoneMapping};
use crate::domain::ports::ZoneLookup;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Lower-case hex without separators
pub fn normalize_wwn(wwn: &str) -> String {
    wwn.chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, Default)]
struct Fabric {
    initiators: BTreeSet<String>,
    targets: BTreeSet<String>,
}

/// Zone lookup backed by a fixed fabric map
#[derive(Debug, Clone, Default)]
pub struct StaticZoneLookup {
    fabrics: BTreeMap<String, Fabric>,
}

impl StaticZoneLookup {
    pub fn new(config: &ZoningConfig) -> Self {
        let fabrics = config
            .fabrics
            .iter()
            .map(|(name, fabric)| {
                (
                    name.clone(),
                    Fabric {
                        initiators: fabric.initiators.iter().map(|w| normalize_wwn(w)).collect(),
                        targets: fabric.targets.iter().map(|w| normalize_wwn(w)).collect(),
                    },
                )
            })
            .collect();
        Self { fabrics }
    }

    pub fn fabric_count(&self) -> usize {
        self.fabrics.len()
    }
}

#[async_trait]
impl ZoneLookup for StaticZoneLookup {
    async fn get_device_mapping(
        &self,
        initiator_wwns: &[String],
        target_wwns: &[String],
    ) -> Result<ZoneMapping> {
        if self.fabrics.is_empty() {
            return Err(Error::ZoneLookup("no fabrics configured".into()));
        }

        let mut mapping = ZoneMapping::new();
        for (name, fabric) in &self.fabrics {
            let initiators: Vec<String> = initiator_wwns
                .iter()
                .map(|w| normalize_wwn(w))
                .filter(|w| fabric.initiators.contains(w))
                .collect();
            let targets: Vec<String> = target_wwns
                .iter()
                .map(|w| normalize_wwn(w))
                .filter(|w| fabric.targets.contains(w))
                .collect();
            if initiators.is_empty() || targets.is_empty() {
                continue;
            }
            debug!(
                "Fabric {} zones {} initiators with {} targets",
                name,
                initiators.len(),
                targets.len()
            );
            mapping.insert(
                name.clone(),
                FabricMapping {
                    initiator_port_wwn_list: initiators,
                    target_port_wwn_list: targets,
                },
            );
        }
        Ok(mapping)
    }
}
