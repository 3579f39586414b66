//! Attachment Orchestrator
//!
//! Drives attach and detach of volumes and snapshots:
//!
//! ```text
//! START ──resolve host──▶ HOST_RESOLVED ──expose──▶ EXPOSED ──build──▶ CONNECTION_BUILT
//!                                                      │
//!                                    build failed ◀────┘  (exposure restored, error re-raised)
//! ```
//!
//! Host resolution is safe to repeat, so nothing is compensated when it or
//! the exposure itself fails. A failure while building connection info
//! restores the exposure to what it was before the call. The core never
//! retries an array operation.

use super::classifier::InitiatorClassifier;
use super::connection::{ConnectionInfoBuilder, ResourceLocation, TargetSelector};
use super::exposure::{ExposureManager, ExposureReceipt};
use super::host::HostResolver;
use super::locks::HostLocks;
use crate::config::{AdapterConfig, DummyLunConfig};
use crate::domain::model::{
    AccessMask, ConnectionInfo, Connector, Protocol, SnapshotRef, TerminateInfo, VolumeRef,
};
use crate::domain::ports::{ArrayGatewayRef, ZoneLookupRef};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the attachment orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub protocol: Protocol,
    /// Serialize exposure per host
    pub host_lock: bool,
    pub dummy_lun: Option<DummyLunConfig>,
    pub io_ports: Vec<String>,
    pub target_seed: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Iscsi,
            host_lock: false,
            dummy_lun: None,
            io_ports: Vec::new(),
            target_seed: None,
        }
    }
}

impl From<&AdapterConfig> for OrchestratorConfig {
    fn from(config: &AdapterConfig) -> Self {
        Self {
            protocol: config.protocol,
            host_lock: config.host_lock_enabled(),
            dummy_lun: config.dummy_lun.clone(),
            io_ports: config.io_ports.clone(),
            target_seed: config.target_seed,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct AttachmentOrchestrator {
    config: OrchestratorConfig,
    gateway: ArrayGatewayRef,
    locks: Arc<HostLocks>,
    resolver: HostResolver,
    exposure: Arc<ExposureManager>,
    builder: ConnectionInfoBuilder,
}

impl AttachmentOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        gateway: ArrayGatewayRef,
        zone_lookup: Option<ZoneLookupRef>,
    ) -> Result<Arc<Self>> {
        let zone_lookup = match (config.protocol, zone_lookup) {
            (Protocol::Fc, lookup) => lookup,
            (_, Some(_)) => {
                warn!("Zone lookup is ignored for {}", config.protocol);
                None
            }
            (_, None) => None,
        };

        let locks = Arc::new(HostLocks::new(config.host_lock));
        let exposure = Arc::new(ExposureManager::new(gateway.clone(), locks.clone()));
        let resolver = HostResolver::new(
            gateway.clone(),
            InitiatorClassifier::new(gateway.clone(), config.protocol),
            exposure.clone(),
            config.dummy_lun.clone(),
        );
        let selector = TargetSelector::new(config.target_seed, &config.io_ports)?;
        let builder = ConnectionInfoBuilder::new(gateway.clone(), config.protocol, zone_lookup, selector);

        info!(
            "Attachment orchestrator using {} over {} (host lock: {}, zoning: {})",
            config.protocol,
            gateway.gateway_name(),
            locks.is_enabled(),
            builder.zoning_enabled()
        );

        Ok(Arc::new(Self {
            config,
            gateway,
            locks,
            resolver,
            exposure,
            builder,
        }))
    }

    pub fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    /// Check the port whitelist against the array
    pub async fn validate_ports(&self) -> Result<()> {
        self.builder.validate_ports().await
    }

    // =========================================================================
    // Attach
    // =========================================================================

    /// Expose a volume to the connector's host and describe how to reach it
    pub async fn initialize_connection(
        &self,
        volume: &VolumeRef,
        connector: &Connector,
    ) -> Result<ConnectionInfo> {
        let span = info_span!("initialize_connection", volume = %volume.id, host = %connector.host);
        async {
            let lun = self
                .gateway
                .get_lun(&volume.lun_id)
                .await
                .map_err(|e| Error::lookup("get_lun", "lun", &volume.lun_id, e))?;

            let host_id = self.resolver.resolve_or_create(connector).await?;
            let receipt = self
                .exposure
                .expose_lun(&lun.id, &host_id, AccessMask::Production)
                .await?;

            let location = ResourceLocation {
                resource_id: &volume.id,
                lun_id: &lun.id,
                snap_id: None,
                owner: lun.current_owner,
            };
            self.build_or_restore(&location, connector, &receipt).await
        }
        .instrument(span)
        .await
    }

    /// Attach a snapshot to the connector's host and describe how to reach it
    pub async fn initialize_snapshot_connection(
        &self,
        snapshot: &SnapshotRef,
        connector: &Connector,
    ) -> Result<ConnectionInfo> {
        let span = info_span!("initialize_snapshot_connection", snapshot = %snapshot.id, host = %connector.host);
        async {
            let snap = self
                .gateway
                .get_snapshot(&snapshot.snap_id)
                .await
                .map_err(|e| Error::lookup("get_snapshot", "snapshot", &snapshot.snap_id, e))?;
            let lun = self
                .gateway
                .get_lun(&snap.lun_id)
                .await
                .map_err(|e| Error::lookup("get_lun", "lun", &snap.lun_id, e))?;

            let host_id = self.resolver.resolve_or_create(connector).await?;
            let receipt = self.exposure.attach_snapshot(&snap.id, &host_id).await?;

            let location = ResourceLocation {
                resource_id: &snapshot.id,
                lun_id: &lun.id,
                snap_id: Some(&snap.id),
                owner: lun.current_owner,
            };
            self.build_or_restore(&location, connector, &receipt).await
        }
        .instrument(span)
        .await
    }

    async fn build_or_restore(
        &self,
        location: &ResourceLocation<'_>,
        connector: &Connector,
        receipt: &ExposureReceipt,
    ) -> Result<ConnectionInfo> {
        match self
            .builder
            .build(location, connector, receipt.host_id())
            .await
        {
            Ok(info) => {
                info!(
                    "Connection of {} to {} ready at lun {}",
                    location.resource_id,
                    receipt.host_id(),
                    info.target_lun()
                );
                Ok(info)
            }
            Err(e) => {
                warn!(
                    "Building connection of {} failed, restoring exposure: {}",
                    location.resource_id, e
                );
                if let Err(restore_err) = self.exposure.restore(receipt).await {
                    error!(
                        "Failed to restore exposure of {} on {}: {}",
                        location.resource_id,
                        receipt.host_id(),
                        restore_err
                    );
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Detach
    // =========================================================================

    /// Revoke a volume from the connector's host
    ///
    /// Without a connector the volume is hidden from every host.
    pub async fn terminate_connection(
        &self,
        volume: &VolumeRef,
        connector: Option<&Connector>,
    ) -> Result<TerminateInfo> {
        let host = connector.map(|c| c.host.as_str()).unwrap_or("*");
        let span = info_span!("terminate_connection", volume = %volume.id, host = %host);
        async {
            let connector = match connector {
                Some(connector) => connector,
                None => {
                    info!("Force detaching {} from all hosts", volume.id);
                    self.exposure.revoke_all(&volume.lun_id).await?;
                    return Ok(self.empty());
                }
            };

            if volume.is_multiattached_to(&connector.host) {
                info!(
                    "Volume {} is attached more than once to {}, leaving it exposed",
                    volume.id, connector.host
                );
                return Ok(self.empty());
            }

            let host_id = match self.resolver.find_existing(connector).await? {
                Some(host_id) => host_id,
                None => {
                    warn!("Host using {} is not found", volume.id);
                    return Ok(self.empty());
                }
            };

            self.exposure.revoke_lun(&volume.lun_id, &host_id).await?;
            self.zone_teardown(connector, &host_id).await
        }
        .instrument(span)
        .await
    }

    /// Detach a snapshot from the connector's host
    ///
    /// Without a connector the snapshot is detached unconditionally.
    pub async fn terminate_snapshot_connection(
        &self,
        snapshot: &SnapshotRef,
        connector: Option<&Connector>,
    ) -> Result<TerminateInfo> {
        let host = connector.map(|c| c.host.as_str()).unwrap_or("*");
        let span = info_span!("terminate_snapshot_connection", snapshot = %snapshot.id, host = %host);
        async {
            let connector = match connector {
                Some(connector) => connector,
                None => {
                    info!("Force detaching {}", snapshot.id);
                    self.exposure.detach_snapshot(&snapshot.snap_id).await?;
                    return Ok(self.empty());
                }
            };

            if snapshot.is_multiattached_to(&connector.host) {
                info!(
                    "Snapshot {} is attached more than once to {}, leaving it attached",
                    snapshot.id, connector.host
                );
                return Ok(self.empty());
            }

            let host_id = match self.resolver.find_existing(connector).await? {
                Some(host_id) => host_id,
                None => {
                    warn!("Host using {} is not found", snapshot.id);
                    return Ok(self.empty());
                }
            };

            self.exposure.detach_snapshot(&snapshot.snap_id).await?;
            self.zone_teardown(connector, &host_id).await
        }
        .instrument(span)
        .await
    }

    fn empty(&self) -> TerminateInfo {
        TerminateInfo::empty(self.config.protocol)
    }

    /// Zone descriptor to deprovision once the host holds no more mappings
    async fn zone_teardown(&self, connector: &Connector, host_id: &str) -> Result<TerminateInfo> {
        if !self.builder.zoning_enabled() {
            return Ok(self.empty());
        }

        let _guard = self.locks.acquire(host_id).await;
        let host = self
            .gateway
            .get_host(host_id)
            .await
            .map_err(|e| Error::array("get_host", host_id, e))?;
        if host.map_or(false, |h| h.has_luns()) {
            debug!("Host {} still has LUNs, keeping its zone", host_id);
            return Ok(self.empty());
        }

        let zone = self.builder.zone_teardown(connector).await?;
        info!("Host {} has no LUNs left, returning zone for removal", host_id);
        Ok(TerminateInfo::with_zone(self.config.protocol, zone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{
        AttachStatus, AttachmentRecord, ConnectionData, FabricMapping, FcConnectionData,
        HostAccess, IscsiConnectionData, StorageProcessor, TargetPort, ZoneMapping,
    };
    use crate::domain::ports::{ArrayGateway, ZoneLookup};
    use crate::error::ArrayErrorKind;
    use crate::gateway::memory::{InMemoryArray, MappingBehavior};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    struct FixedZones(ZoneMapping);

    #[async_trait]
    impl ZoneLookup for FixedZones {
        async fn get_device_mapping(
            &self,
            _initiator_wwns: &[String],
            _target_wwns: &[String],
        ) -> Result<ZoneMapping> {
            Ok(self.0.clone())
        }
    }

    fn orchestrator(
        array: &Arc<InMemoryArray>,
        protocol: Protocol,
        zones: Option<ZoneMapping>,
    ) -> Arc<AttachmentOrchestrator> {
        let config = OrchestratorConfig {
            protocol,
            host_lock: zones.is_some(),
            target_seed: Some(1),
            ..Default::default()
        };
        let lookup = zones.map(|z| Arc::new(FixedZones(z)) as ZoneLookupRef);
        AttachmentOrchestrator::new(config, array.clone(), lookup).unwrap()
    }

    fn iscsi_array() -> Arc<InMemoryArray> {
        let array = Arc::new(InMemoryArray::new());
        array.add_port(TargetPort::iscsi("spa_eth2", StorageProcessor::A, "iqn1", "10.0.0.1"));
        array.add_port(TargetPort::iscsi("spa_eth3", StorageProcessor::A, "iqn2", "10.0.0.2"));
        array
    }

    fn fc_array() -> Arc<InMemoryArray> {
        let array = Arc::new(InMemoryArray::new());
        array.add_port(TargetPort::fc("spa_fc0", StorageProcessor::A, "50060160b6e00e5a", "5006016036e00e5a"));
        array.add_port(TargetPort::fc("spa_fc1", StorageProcessor::A, "50060160b6e00e5a", "5006016136e00e5a"));
        array.add_port(TargetPort::fc("spb_fc0", StorageProcessor::B, "50060160b6e00e5a", "5006016836e00e5a"));
        array.add_port(TargetPort::fc("spb_fc1", StorageProcessor::B, "50060160b6e00e5a", "5006016936e00e5a"));
        array
    }

    fn fc_connector() -> Connector {
        Connector::fc(
            "h1",
            vec!["20000090fa0d6754".into(), "20000090fa0d6755".into()],
            vec!["10000090fa0d6754".into(), "10000090fa0d6755".into()],
        )
    }

    fn attached(host: &str) -> AttachmentRecord {
        AttachmentRecord {
            attached_host: Some(host.to_string()),
            status: AttachStatus::Attached,
            attached_at: None,
        }
    }

    fn iscsi_data(info: &ConnectionInfo) -> &IscsiConnectionData {
        match &info.data {
            ConnectionData::Iscsi(d) => d,
            other => panic!("expected iSCSI data, got {:?}", other),
        }
    }

    fn fc_data(info: &ConnectionInfo) -> &FcConnectionData {
        match &info.data {
            ConnectionData::Fc(d) => d,
            other => panic!("expected FC data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_iscsi_attach_end_to_end() {
        let array = iscsi_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        array.set_mapping_behavior(&lun, MappingBehavior::Fixed(7));
        let orch = orchestrator(&array, Protocol::Iscsi, None);

        let info = orch
            .initialize_connection(&VolumeRef::new("vol-1", &lun), &Connector::iscsi("h1", "iqn.test"))
            .await
            .unwrap();

        assert_eq!(info.driver_volume_type, "iscsi");
        let data = iscsi_data(&info);
        assert!(data.target_discovered);
        assert_eq!(data.target_lun, 7);
        assert_eq!(data.target_luns, vec![7, 7]);
        assert_eq!(data.volume_id, "vol-1");

        let iqns: BTreeSet<_> = data.target_iqns.iter().cloned().collect();
        assert_eq!(iqns, BTreeSet::from(["iqn1".to_string(), "iqn2".to_string()]));
        let portals: BTreeSet<_> = data.target_portals.iter().cloned().collect();
        assert_eq!(
            portals,
            BTreeSet::from(["10.0.0.1:3260".to_string(), "10.0.0.2:3260".to_string()])
        );
        // Scalar fields mirror the first entry
        assert_eq!(data.target_iqn, data.target_iqns[0]);
        assert_eq!(data.target_portal, data.target_portals[0]);
        // IQN and portal of each entry come from the same port
        let idx = data.target_iqns.iter().position(|i| i == "iqn2").unwrap();
        assert_eq!(data.target_portals[idx], "10.0.0.2:3260");
    }

    #[tokio::test]
    async fn test_iscsi_fan_out_covers_every_port() {
        let array = iscsi_array();
        array.add_port(TargetPort::iscsi("spb_eth2", StorageProcessor::B, "iqn3", "10.0.1.1"));
        let lun = array.add_lun("vol-1", StorageProcessor::B);
        let orch = orchestrator(&array, Protocol::Iscsi, None);

        let info = orch
            .initialize_connection(&VolumeRef::new("vol-1", &lun), &Connector::iscsi("h1", "iqn.test"))
            .await
            .unwrap();
        let data = iscsi_data(&info);
        assert_eq!(data.target_iqns.len(), 3);
        assert_eq!(data.target_portals.len(), 3);
        assert_eq!(data.target_luns.len(), 3);
        assert!(data.target_luns.iter().all(|l| *l == data.target_lun));
        assert_eq!(data.target_iqns[0], "iqn3");
    }

    #[tokio::test]
    async fn test_reattach_is_idempotent() {
        let array = iscsi_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let orch = orchestrator(&array, Protocol::Iscsi, None);
        let volume = VolumeRef::new("vol-1", &lun);
        let connector = Connector::iscsi("h1", "iqn.test");

        let first = orch.initialize_connection(&volume, &connector).await.unwrap();
        let hosts = array.host_count();
        let initiators = array.initiator_count();
        array.clear_calls();

        let second = orch.initialize_connection(&volume, &connector).await.unwrap();
        assert_eq!(first.target_lun(), second.target_lun());
        let first_iqns: BTreeSet<_> = iscsi_data(&first).target_iqns.iter().collect();
        let second_iqns: BTreeSet<_> = iscsi_data(&second).target_iqns.iter().collect();
        assert_eq!(first_iqns, second_iqns);

        assert_eq!(array.host_count(), hosts);
        assert_eq!(array.initiator_count(), initiators);
        assert_eq!(array.count_calls("create_host"), 0);
        assert_eq!(array.count_calls("create_initiator"), 0);
        assert_eq!(array.count_calls("register_initiator"), 0);
    }

    #[tokio::test]
    async fn test_missing_hlu_rolls_back_exposure() {
        let array = iscsi_array();
        let other = array.add_host("other");
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        array
            .modify_lun_access(&lun, None, &[HostAccess::new(other, AccessMask::Production)])
            .await
            .unwrap();
        array.set_mapping_behavior(&lun, MappingBehavior::Hidden);
        let before = array.lun(&lun).unwrap().host_access;
        let orch = orchestrator(&array, Protocol::Iscsi, None);

        let err = orch
            .initialize_connection(&VolumeRef::new("vol-1", &lun), &Connector::iscsi("h1", "iqn.test"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::HluNotFound { .. });
        assert_eq!(array.lun(&lun).unwrap().host_access, before);
    }

    #[tokio::test]
    async fn test_failed_reattach_keeps_existing_mapping() {
        let array = iscsi_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let orch = orchestrator(&array, Protocol::Iscsi, None);
        let volume = VolumeRef::new("vol-1", &lun);
        let connector = Connector::iscsi("h1", "iqn.test");

        orch.initialize_connection(&volume, &connector).await.unwrap();
        let before = array.lun(&lun).unwrap().host_access;

        array.fail_next("get_target_ports", ArrayErrorKind::Transport);
        let err = orch.initialize_connection(&volume, &connector).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(array.lun(&lun).unwrap().host_access, before);
    }

    #[tokio::test]
    async fn test_no_target_ports_rolls_back() {
        let array = Arc::new(InMemoryArray::new());
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let orch = orchestrator(&array, Protocol::Iscsi, None);

        let err = orch
            .initialize_connection(&VolumeRef::new("vol-1", &lun), &Connector::iscsi("h1", "iqn.test"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::NoTargetPorts);
        assert!(array.lun(&lun).unwrap().host_access.is_empty());
    }

    #[tokio::test]
    async fn test_missing_initiator_touches_nothing() {
        let array = iscsi_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let orch = orchestrator(&array, Protocol::Iscsi, None);

        let connector = Connector {
            host: "h1".into(),
            ..Default::default()
        };
        let err = orch
            .initialize_connection(&VolumeRef::new("vol-1", &lun), &connector)
            .await
            .unwrap_err();
        assert_matches!(err, Error::MissingInitiator { .. });
        assert!(array.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_volume_is_not_found() {
        let array = iscsi_array();
        let orch = orchestrator(&array, Protocol::Iscsi, None);

        let err = orch
            .initialize_connection(&VolumeRef::new("vol-1", "sv_404"), &Connector::iscsi("h1", "iqn.test"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ResourceNotFound { .. });
    }

    #[tokio::test]
    async fn test_fc_owner_processor_preferred() {
        let array = fc_array();
        let lun = array.add_lun("vol-1", StorageProcessor::B);
        let connector = fc_connector();
        for port in ["spa_fc0", "spa_fc1", "spb_fc0", "spb_fc1"] {
            array.add_login_path("20000090FA0D675410000090FA0D6754", port, true);
        }
        let orch = orchestrator(&array, Protocol::Fc, None);
        let volume = VolumeRef::new("vol-1", &lun);

        let spb: BTreeSet<String> = ["50:06:01:60:B6:E0:0E:5A:50:06:01:68:36:E0:0E:5A", "50:06:01:60:B6:E0:0E:5A:50:06:01:69:36:E0:0E:5A"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for _ in 0..5 {
            let info = orch.initialize_connection(&volume, &connector).await.unwrap();
            let data = fc_data(&info);
            assert_eq!(data.target_wwn.len(), 4);
            let head: BTreeSet<String> = data.target_wwn[..2].iter().cloned().collect();
            assert_eq!(head, spb);
        }
    }

    #[tokio::test]
    async fn test_fc_without_zoning_uses_logged_in_ports() {
        let array = fc_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let connector = fc_connector();
        array.add_login_path("20000090FA0D675410000090FA0D6754", "spa_fc0", true);
        array.add_login_path("20000090FA0D675410000090FA0D6754", "spa_fc1", false);
        let orch = orchestrator(&array, Protocol::Fc, None);

        let info = orch
            .initialize_connection(&VolumeRef::new("vol-1", &lun), &connector)
            .await
            .unwrap();
        assert_eq!(info.driver_volume_type, "fibre_channel");
        let data = fc_data(&info);
        assert_eq!(data.target_wwn, vec!["50:06:01:60:B6:E0:0E:5A:50:06:01:60:36:E0:0E:5A"]);
        assert!(data.initiator_target_map.is_none());

        let json = serde_json::to_value(&info).unwrap();
        assert!(json["data"].get("initiator_target_map").is_none());
    }

    #[tokio::test]
    async fn test_fc_without_paths_rolls_back() {
        let array = fc_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let orch = orchestrator(&array, Protocol::Fc, None);

        let err = orch
            .initialize_connection(&VolumeRef::new("vol-1", &lun), &fc_connector())
            .await
            .unwrap_err();
        assert_matches!(err, Error::NoAccessiblePaths { .. });
        assert!(array.lun(&lun).unwrap().host_access.is_empty());
    }

    fn san1() -> ZoneMapping {
        let mut zones = ZoneMapping::new();
        zones.insert(
            "san1".into(),
            FabricMapping {
                initiator_port_wwn_list: vec!["A".into(), "B".into()],
                target_port_wwn_list: vec!["T1".into(), "T2".into()],
            },
        );
        zones
    }

    #[tokio::test]
    async fn test_fc_with_zoning_maps_initiators() {
        let array = fc_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let orch = orchestrator(&array, Protocol::Fc, Some(san1()));

        let info = orch
            .initialize_connection(&VolumeRef::new("vol-1", &lun), &fc_connector())
            .await
            .unwrap();
        let data = fc_data(&info);
        let map = data.initiator_target_map.as_ref().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["A"], vec!["T1", "T2"]);
        assert_eq!(map["B"], vec!["T1", "T2"]);
        assert_eq!(data.target_wwn, vec!["T1", "T2"]);
    }

    #[tokio::test]
    async fn test_zone_returned_when_last_lun_detached() {
        let array = fc_array();
        let lun_a = array.add_lun("vol-a", StorageProcessor::A);
        let lun_b = array.add_lun("vol-b", StorageProcessor::A);
        let orch = orchestrator(&array, Protocol::Fc, Some(san1()));
        let connector = fc_connector();
        let vol_a = VolumeRef::new("vol-a", &lun_a);
        let vol_b = VolumeRef::new("vol-b", &lun_b);

        orch.initialize_connection(&vol_a, &connector).await.unwrap();
        orch.initialize_connection(&vol_b, &connector).await.unwrap();

        let result = orch.terminate_connection(&vol_a, Some(&connector)).await.unwrap();
        assert!(result.is_empty());

        let result = orch.terminate_connection(&vol_b, Some(&connector)).await.unwrap();
        let zone = result.data.zone.unwrap();
        assert_eq!(zone.target_wwn, vec!["T1", "T2"]);
        assert_eq!(zone.initiator_target_map.len(), 2);
    }

    #[tokio::test]
    async fn test_multi_attach_guard_skips_detach() {
        let array = iscsi_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let orch = orchestrator(&array, Protocol::Iscsi, None);
        let connector = Connector::iscsi("h1", "iqn.test");
        let mut volume = VolumeRef::new("vol-1", &lun);
        orch.initialize_connection(&volume, &connector).await.unwrap();
        array.clear_calls();

        volume.attachments = vec![attached("h1"), attached("h1")];
        let result = orch.terminate_connection(&volume, Some(&connector)).await.unwrap();
        assert!(result.is_empty());
        assert!(array.mutating_calls().is_empty());
        assert_eq!(array.lun(&lun).unwrap().host_access.len(), 1);

        // One attachment per host is an ordinary detach
        volume.attachments = vec![attached("h1"), attached("h2")];
        orch.terminate_connection(&volume, Some(&connector)).await.unwrap();
        assert!(array.lun(&lun).unwrap().host_access.is_empty());
    }

    #[tokio::test]
    async fn test_detach_of_unknown_host_is_noop() {
        let array = iscsi_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let orch = orchestrator(&array, Protocol::Iscsi, None);

        let result = orch
            .terminate_connection(&VolumeRef::new("vol-1", &lun), Some(&Connector::iscsi("h9", "iqn.none")))
            .await
            .unwrap();
        assert!(result.is_empty());
        assert!(array.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_force_detach_hides_from_all_hosts() {
        let array = iscsi_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let orch = orchestrator(&array, Protocol::Iscsi, None);
        let volume = VolumeRef::new("vol-1", &lun);
        orch.initialize_connection(&volume, &Connector::iscsi("h1", "iqn.one")).await.unwrap();
        orch.initialize_connection(&volume, &Connector::iscsi("h2", "iqn.two")).await.unwrap();

        let result = orch.terminate_connection(&volume, None).await.unwrap();
        assert!(result.is_empty());
        assert!(array.lun(&lun).unwrap().host_access.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_attach_and_detach() {
        let array = iscsi_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let snap = array.add_snapshot(&lun, "snap-1");
        let orch = orchestrator(&array, Protocol::Iscsi, None);
        let snapshot = SnapshotRef::new("snapshot-1", &snap);
        let connector = Connector::iscsi("h1", "iqn.test");

        let info = orch
            .initialize_snapshot_connection(&snapshot, &connector)
            .await
            .unwrap();
        assert_eq!(iscsi_data(&info).volume_id, "snapshot-1");
        assert!(array.snapshot(&snap).unwrap().attached_host().is_some());
        // The LUN itself is not exposed
        assert!(array.lun(&lun).unwrap().host_access.is_empty());

        orch.terminate_snapshot_connection(&snapshot, Some(&connector))
            .await
            .unwrap();
        assert!(array.snapshot(&snap).unwrap().attached_host().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_rollback_detaches() {
        let array = iscsi_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let snap = array.add_snapshot(&lun, "snap-1");
        array.set_mapping_behavior(&lun, MappingBehavior::NoHlu);
        let orch = orchestrator(&array, Protocol::Iscsi, None);

        let err = orch
            .initialize_snapshot_connection(&SnapshotRef::new("snapshot-1", &snap), &Connector::iscsi("h1", "iqn.test"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::HluNotFound { .. });
        assert!(array.snapshot(&snap).unwrap().attached_host().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_of_other_host_survives_failed_attach() {
        let array = iscsi_array();
        let lun = array.add_lun("vol-1", StorageProcessor::A);
        let snap = array.add_snapshot(&lun, "snap-1");
        let other = array.add_host("h3");
        array.attach_snapshot(&snap, &other).await.unwrap();
        array.set_mapping_behavior(&lun, MappingBehavior::NoHlu);
        let orch = orchestrator(&array, Protocol::Iscsi, None);

        let err = orch
            .initialize_snapshot_connection(&SnapshotRef::new("snapshot-1", &snap), &Connector::iscsi("h1", "iqn.test"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Exposure { action: "attach", .. });
        assert_eq!(array.snapshot(&snap).unwrap().attached_host(), Some(other.as_str()));
        assert_eq!(array.count_calls("detach_snapshot"), 0);
    }
}
