//! Connection Info Builder
//!
//! Turns an exposed resource into the protocol-specific parameters the host
//! needs to reach it.
//!
//! Target ports are grouped by storage processor. The owning processor's
//! ports come first; order within each group is shuffled by a
//! [`TargetSelector`] whose generator can be seeded for reproducible runs.
//! Fibre Channel targets are either taken from a zone lookup or narrowed to
//! the ports the host's initiators are logged in on.

use crate::domain::model::{
    ConnectionInfo, Connector, FcConnectionData, FcZoneInfo, HostLunQuery, IscsiConnectionData,
    Protocol, StorageProcessor, TargetPort, ZoneMapping,
};
use crate::domain::ports::{ArrayGatewayRef, ZoneLookupRef};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use tracing::{debug, error};

// =============================================================================
// Target Selection
// =============================================================================

/// Port whitelist and owner-first ordering
pub struct TargetSelector {
    rng: Mutex<StdRng>,
    patterns: Vec<glob::Pattern>,
}

impl TargetSelector {
    pub fn new(seed: Option<u64>, io_ports: &[String]) -> Result<Self> {
        let patterns = io_ports
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| {
                    Error::Configuration(format!("invalid io_ports pattern {}: {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            rng: Mutex::new(rng),
            patterns,
        })
    }

    fn allowed(&self, port: &TargetPort) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(&port.id))
    }

    /// Ports passing the whitelist
    pub fn filter(&self, ports: Vec<TargetPort>) -> Vec<TargetPort> {
        ports.into_iter().filter(|p| self.allowed(p)).collect()
    }

    /// Fail unless every whitelist pattern matches at least one port
    pub fn check_whitelist(&self, ports: &[TargetPort]) -> Result<()> {
        let unmatched: Vec<&str> = self
            .patterns
            .iter()
            .filter(|pattern| !ports.iter().any(|port| pattern.matches(&port.id)))
            .map(|pattern| pattern.as_str())
            .collect();
        if unmatched.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(format!(
                "io_ports patterns match no port: {}",
                unmatched.join(", ")
            )))
        }
    }

    /// Owner processor's ports first, each group shuffled
    pub fn order(&self, ports: Vec<TargetPort>, owner: StorageProcessor) -> Vec<TargetPort> {
        let (mut preferred, mut others): (Vec<_>, Vec<_>) =
            ports.into_iter().partition(|p| p.sp == owner);
        {
            let mut rng = self.rng.lock();
            preferred.shuffle(&mut *rng);
            others.shuffle(&mut *rng);
        }
        preferred.extend(others);
        preferred
    }
}

// =============================================================================
// Zoning
// =============================================================================

/// Flatten a per-fabric mapping into a target list and initiator map
///
/// Targets are de-duplicated in first-seen order. An initiator listed under
/// several fabrics keeps the targets of the last one.
pub fn build_init_targ_map(mapping: &ZoneMapping) -> FcZoneInfo {
    let mut info = FcZoneInfo::default();
    for fabric in mapping.values() {
        for target in &fabric.target_port_wwn_list {
            if !info.target_wwn.contains(target) {
                info.target_wwn.push(target.clone());
            }
        }
        for initiator in &fabric.initiator_port_wwn_list {
            info.initiator_target_map
                .insert(initiator.clone(), fabric.target_port_wwn_list.clone());
        }
    }
    debug!("target_wwns: {:?}", info.target_wwn);
    debug!("init_targ_map: {:?}", info.initiator_target_map);
    info
}

// =============================================================================
// Builder
// =============================================================================

/// Where an exposed resource lives
#[derive(Debug, Clone, Copy)]
pub struct ResourceLocation<'a> {
    /// Platform id echoed back as `volume_id`
    pub resource_id: &'a str,
    pub lun_id: &'a str,
    pub snap_id: Option<&'a str>,
    pub owner: StorageProcessor,
}

pub struct ConnectionInfoBuilder {
    gateway: ArrayGatewayRef,
    protocol: Protocol,
    zone_lookup: Option<ZoneLookupRef>,
    selector: TargetSelector,
}

impl ConnectionInfoBuilder {
    pub fn new(
        gateway: ArrayGatewayRef,
        protocol: Protocol,
        zone_lookup: Option<ZoneLookupRef>,
        selector: TargetSelector,
    ) -> Self {
        Self {
            gateway,
            protocol,
            zone_lookup,
            selector,
        }
    }

    pub fn zoning_enabled(&self) -> bool {
        self.protocol == Protocol::Fc && self.zone_lookup.is_some()
    }

    /// Whitelisted ports of the active protocol
    pub async fn available_ports(&self) -> Result<Vec<TargetPort>> {
        let ports = self
            .gateway
            .get_target_ports(self.protocol)
            .await
            .map_err(|e| Error::array("get_target_ports", self.protocol.to_string(), e))?;
        Ok(self.selector.filter(ports))
    }

    /// Check the whitelist against the ports the array reports
    pub async fn validate_ports(&self) -> Result<()> {
        let ports = self
            .gateway
            .get_target_ports(self.protocol)
            .await
            .map_err(|e| Error::array("get_target_ports", self.protocol.to_string(), e))?;
        self.selector.check_whitelist(&ports)
    }

    /// Candidate targets, owner processor first
    pub async fn ordered_targets(&self, owner: StorageProcessor) -> Result<Vec<TargetPort>> {
        let targets = self.selector.order(self.available_ports().await?, owner);
        if targets.is_empty() {
            error!("No target ports are available");
            return Err(Error::NoTargetPorts);
        }
        Ok(targets)
    }

    async fn find_hlu(&self, host_id: &str, location: &ResourceLocation<'_>) -> Result<u32> {
        let query = HostLunQuery::new(host_id, location.lun_id, location.snap_id);
        let mappings = self
            .gateway
            .get_host_lun_mappings(&query)
            .await
            .map_err(|e| Error::array("get_host_lun_mappings", location.lun_id, e))?;

        mappings
            .first()
            .and_then(|m| m.hlu)
            .ok_or_else(|| {
                let resource = location.snap_id.unwrap_or(location.lun_id).to_string();
                error!("Can not get the hlu information of host {} for {}", host_id, resource);
                Error::HluNotFound {
                    host_id: host_id.to_string(),
                    resource,
                }
            })
    }

    /// Ports the host's FC initiators are logged in on
    async fn logged_in_ports(&self, host_id: &str) -> Result<HashSet<String>> {
        let host = self
            .gateway
            .get_host(host_id)
            .await
            .map_err(|e| Error::array("get_host", host_id, e))?;
        let initiators: Vec<_> = host
            .iter()
            .flat_map(|h| h.fc_initiators())
            .map(|i| i.id.clone())
            .collect();
        if initiators.is_empty() {
            error!("No FC initiator of {} can access resources", host_id);
            return Err(Error::NoAccessiblePaths {
                host_id: host_id.to_string(),
            });
        }

        let mut logged_in = HashSet::new();
        for initiator_id in &initiators {
            let paths = self
                .gateway
                .get_fc_login_paths(initiator_id)
                .await
                .map_err(|e| Error::array("get_fc_login_paths", initiator_id, e))?;
            logged_in.extend(
                paths
                    .into_iter()
                    .filter(|p| p.is_logged_in)
                    .map(|p| p.port_id),
            );
        }
        Ok(logged_in)
    }

    async fn zone_info(&self, connector: &Connector, targets: &[TargetPort]) -> Result<FcZoneInfo> {
        let lookup = self
            .zone_lookup
            .as_ref()
            .ok_or_else(|| Error::ZoneLookup("no zone lookup configured".into()))?;
        let target_wwns: Vec<String> = targets
            .iter()
            .filter_map(|t| t.port_wwn().map(str::to_string))
            .collect();
        let mapping = lookup
            .get_device_mapping(connector.port_wwns(), &target_wwns)
            .await?;
        Ok(build_init_targ_map(&mapping))
    }

    /// Zone descriptor covering every candidate target
    pub async fn zone_teardown(&self, connector: &Connector) -> Result<FcZoneInfo> {
        let mut targets = self.available_ports().await?;
        targets.sort_by(|a, b| a.sp.cmp(&b.sp).then_with(|| a.id.cmp(&b.id)));
        self.zone_info(connector, &targets).await
    }

    pub async fn build(
        &self,
        location: &ResourceLocation<'_>,
        connector: &Connector,
        host_id: &str,
    ) -> Result<ConnectionInfo> {
        let targets = self.ordered_targets(location.owner).await?;
        let hlu = self.find_hlu(host_id, location).await?;

        match self.protocol {
            Protocol::Iscsi => Ok(Self::iscsi_info(location, &targets, hlu)),
            Protocol::Fc => self.fc_info(location, connector, host_id, &targets, hlu).await,
        }
    }

    fn iscsi_info(location: &ResourceLocation<'_>, targets: &[TargetPort], hlu: u32) -> ConnectionInfo {
        let target_iqns: Vec<String> = targets
            .iter()
            .filter_map(|t| t.iqn().map(str::to_string))
            .collect();
        let target_portals: Vec<String> = targets.iter().filter_map(TargetPort::portal).collect();

        ConnectionInfo::iscsi(IscsiConnectionData {
            target_discovered: true,
            target_iqn: target_iqns.first().cloned().unwrap_or_default(),
            target_portal: target_portals.first().cloned().unwrap_or_default(),
            target_lun: hlu,
            target_luns: vec![hlu; target_iqns.len()],
            target_iqns,
            target_portals,
            volume_id: location.resource_id.to_string(),
        })
    }

    async fn fc_info(
        &self,
        location: &ResourceLocation<'_>,
        connector: &Connector,
        host_id: &str,
        targets: &[TargetPort],
        hlu: u32,
    ) -> Result<ConnectionInfo> {
        // Fails when the host has no FC initiator, zoned or not
        let logged_in = self.logged_in_ports(host_id).await?;
        let (target_wwn, initiator_target_map) = if self.zone_lookup.is_some() {
            let zone = self.zone_info(connector, targets).await?;
            (zone.target_wwn, Some(zone.initiator_target_map))
        } else {
            let accessible: Vec<String> = targets
                .iter()
                .filter(|t| logged_in.contains(&t.id))
                .filter_map(TargetPort::wwn)
                .collect();
            if accessible.is_empty() {
                error!("No FC initiator in {} has paths to the system", host_id);
                return Err(Error::NoAccessiblePaths {
                    host_id: host_id.to_string(),
                });
            }
            (accessible, None)
        };
        debug!("FC target WWNs accessible to {}: {:?}", connector.host, target_wwn);

        Ok(ConnectionInfo::fc(FcConnectionData {
            target_discovered: true,
            target_lun: hlu,
            target_wwn,
            initiator_target_map,
            volume_id: location.resource_id.to_string(),
        }))
    }
}
