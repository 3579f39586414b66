//! Domain Model - Array objects and attachment values
//!
//! Array-side objects (hosts, initiators, LUNs, snapshots, ports) as seen
//! through the gateway, the platform-side inputs (connector, volume and
//! snapshot references) and the connection descriptors handed back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// iSCSI well-known port appended to every portal address
pub const ISCSI_PORT: u16 = 3260;

// =============================================================================
// Protocol
// =============================================================================

/// Block transport protocol used to reach the array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Iscsi,
    Fc,
}

impl Protocol {
    /// Volume type tag expected by host-side attach code
    pub fn driver_volume_type(&self) -> &'static str {
        match self {
            Protocol::Iscsi => "iscsi",
            Protocol::Fc => "fibre_channel",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Iscsi => write!(f, "iSCSI"),
            Protocol::Fc => write!(f, "FC"),
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Compute-node attachment request as supplied by the platform
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connector {
    /// Host name, may be empty
    #[serde(default)]
    pub host: String,
    /// iSCSI initiator IQN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    /// FC node WWNs, parallel to `wwpns`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wwnns: Option<Vec<String>>,
    /// FC port WWNs, parallel to `wwnns`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wwpns: Option<Vec<String>>,
}

impl Connector {
    pub fn iscsi(host: impl Into<String>, iqn: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            initiator: Some(iqn.into()),
            ..Default::default()
        }
    }

    pub fn fc(host: impl Into<String>, wwnns: Vec<String>, wwpns: Vec<String>) -> Self {
        Self {
            host: host.into(),
            wwnns: Some(wwnns),
            wwpns: Some(wwpns),
            ..Default::default()
        }
    }

    /// Port WWNs, empty when the connector carries none
    pub fn port_wwns(&self) -> &[String] {
        self.wwpns.as_deref().unwrap_or(&[])
    }
}

// =============================================================================
// Hosts and Initiators
// =============================================================================

/// Host-side protocol endpoint registered on the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiator {
    pub id: String,
    /// IQN or upper-case WWN pair
    pub uid: String,
    pub protocol: Protocol,
    /// Owning host, `None` for orphan initiators
    pub host_id: Option<String>,
}

impl Initiator {
    pub fn is_registered(&self) -> bool {
        self.host_id.as_deref().map_or(false, |h| !h.is_empty())
    }
}

/// Array representation of a compute node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub initiators: Vec<Initiator>,
    /// Ids of host-LUN mappings currently held by this host
    #[serde(default)]
    pub host_luns: Vec<String>,
}

impl Host {
    pub fn fc_initiators(&self) -> impl Iterator<Item = &Initiator> {
        self.initiators.iter().filter(|i| i.protocol == Protocol::Fc)
    }

    pub fn has_luns(&self) -> bool {
        !self.host_luns.is_empty()
    }
}

// =============================================================================
// Access Masks and Host-LUN Mappings
// =============================================================================

/// Permission level of a host-to-resource mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum AccessMask {
    NoAccess,
    Production,
    Snapshot,
    Both,
    Mixed,
}

impl From<AccessMask> for u32 {
    fn from(mask: AccessMask) -> u32 {
        match mask {
            AccessMask::NoAccess => 0,
            AccessMask::Production => 1,
            AccessMask::Snapshot => 2,
            AccessMask::Both => 3,
            AccessMask::Mixed => 0xffff,
        }
    }
}

impl TryFrom<u32> for AccessMask {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(AccessMask::NoAccess),
            1 => Ok(AccessMask::Production),
            2 => Ok(AccessMask::Snapshot),
            3 => Ok(AccessMask::Both),
            0xffff => Ok(AccessMask::Mixed),
            other => Err(format!("unknown access mask {}", other)),
        }
    }
}

/// One entry of a LUN's host access list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAccess {
    pub host_id: String,
    pub access_mask: AccessMask,
}

impl HostAccess {
    pub fn new(host_id: impl Into<String>, access_mask: AccessMask) -> Self {
        Self {
            host_id: host_id.into(),
            access_mask,
        }
    }
}

/// Kind of resource a host-LUN mapping points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostLunType {
    Lun,
    LunSnap,
}

impl HostLunType {
    /// Numeric value used by the array's filter syntax
    pub fn as_code(&self) -> u32 {
        match self {
            HostLunType::Lun => 1,
            HostLunType::LunSnap => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(HostLunType::Lun),
            2 => Some(HostLunType::LunSnap),
            _ => None,
        }
    }
}

/// Array-side (host, resource) mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLunMapping {
    pub id: String,
    pub host_id: String,
    pub lun_id: String,
    pub snap_id: Option<String>,
    pub lun_type: HostLunType,
    /// Host LUN unit, absent when the array has not assigned one
    pub hlu: Option<u32>,
}

/// Filter for host-LUN mapping lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLunQuery {
    pub host_id: String,
    pub lun_id: String,
    pub lun_type: HostLunType,
    pub snap_id: Option<String>,
}

impl HostLunQuery {
    pub fn new(host_id: &str, lun_id: &str, snap_id: Option<&str>) -> Self {
        Self {
            host_id: host_id.to_string(),
            lun_id: lun_id.to_string(),
            lun_type: if snap_id.is_some() {
                HostLunType::LunSnap
            } else {
                HostLunType::Lun
            },
            snap_id: snap_id.map(str::to_string),
        }
    }

    pub fn matches(&self, mapping: &HostLunMapping) -> bool {
        mapping.host_id == self.host_id
            && mapping.lun_id == self.lun_id
            && mapping.lun_type == self.lun_type
            && (self.lun_type == HostLunType::Lun || mapping.snap_id == self.snap_id)
    }
}

// =============================================================================
// LUNs and Snapshots
// =============================================================================

/// Storage processor owning a LUN or a target port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProcessor {
    A,
    B,
}

impl StorageProcessor {
    /// Derive the processor from an array object id such as `spa_eth2` or `spb`
    pub fn from_object_id(id: &str) -> Option<Self> {
        let lower = id.to_ascii_lowercase();
        if lower.starts_with("spa") {
            Some(StorageProcessor::A)
        } else if lower.starts_with("spb") {
            Some(StorageProcessor::B)
        } else {
            None
        }
    }

    pub fn peer(&self) -> Self {
        match self {
            StorageProcessor::A => StorageProcessor::B,
            StorageProcessor::B => StorageProcessor::A,
        }
    }
}

impl std::fmt::Display for StorageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageProcessor::A => write!(f, "a"),
            StorageProcessor::B => write!(f, "b"),
        }
    }
}

/// LUN exposure and location record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lun {
    pub id: String,
    pub name: String,
    /// Processor currently owning the LUN
    pub current_owner: StorageProcessor,
    #[serde(default)]
    pub host_access: Vec<HostAccess>,
    /// Consistency group the LUN belongs to
    #[serde(default)]
    pub cg_id: Option<String>,
}

impl Lun {
    pub fn access_for(&self, host_id: &str) -> Option<&HostAccess> {
        self.host_access.iter().find(|a| a.host_id == host_id)
    }
}

/// Parameters for creating a LUN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunSpec {
    pub pool_id: String,
    pub name: String,
    pub size_bytes: u64,
}

/// Snapshot record; at most one attached host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    /// LUN the snapshot was taken from
    pub lun_id: String,
    #[serde(default)]
    pub host_access: Vec<HostAccess>,
}

impl Snapshot {
    pub fn attached_host(&self) -> Option<&str> {
        self.host_access.first().map(|a| a.host_id.as_str())
    }
}

// =============================================================================
// Target Ports
// =============================================================================

/// Protocol-specific address of an array target port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetAddress {
    Iscsi { iqn: String, ip: String },
    Fc { node_wwn: String, port_wwn: String },
}

/// Physical array port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPort {
    pub id: String,
    pub sp: StorageProcessor,
    pub address: TargetAddress,
}

impl TargetPort {
    pub fn iscsi(id: &str, sp: StorageProcessor, iqn: &str, ip: &str) -> Self {
        Self {
            id: id.to_string(),
            sp,
            address: TargetAddress::Iscsi {
                iqn: iqn.to_string(),
                ip: ip.to_string(),
            },
        }
    }

    pub fn fc(id: &str, sp: StorageProcessor, node_wwn: &str, port_wwn: &str) -> Self {
        Self {
            id: id.to_string(),
            sp,
            address: TargetAddress::Fc {
                node_wwn: node_wwn.to_string(),
                port_wwn: port_wwn.to_string(),
            },
        }
    }

    /// `ip:3260` for iSCSI ports
    pub fn portal(&self) -> Option<String> {
        match &self.address {
            TargetAddress::Iscsi { ip, .. } => Some(format!("{}:{}", ip, ISCSI_PORT)),
            TargetAddress::Fc { .. } => None,
        }
    }

    pub fn iqn(&self) -> Option<&str> {
        match &self.address {
            TargetAddress::Iscsi { iqn, .. } => Some(iqn),
            TargetAddress::Fc { .. } => None,
        }
    }

    pub fn port_wwn(&self) -> Option<&str> {
        match &self.address {
            TargetAddress::Fc { port_wwn, .. } => Some(port_wwn),
            TargetAddress::Iscsi { .. } => None,
        }
    }

    /// Node and port WWN concatenated as colon-delimited upper-case hex
    pub fn wwn(&self) -> Option<String> {
        match &self.address {
            TargetAddress::Fc { node_wwn, port_wwn } => {
                Some(colon_delimited(&format!("{}{}", node_wwn, port_wwn)))
            }
            TargetAddress::Iscsi { .. } => None,
        }
    }
}

/// Format a hex string as `AA:BB:...`, dropping any existing separators
pub fn colon_delimited(hex: &str) -> String {
    let digits: Vec<char> = hex
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    digits
        .chunks(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
}

/// Login state of one initiator-to-port path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatorPath {
    pub initiator_id: String,
    pub port_id: String,
    pub is_logged_in: bool,
}

// =============================================================================
// Platform References
// =============================================================================

/// Platform-side attachment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachStatus {
    Attaching,
    Attached,
    Detaching,
    Detached,
}

/// Platform-side attachment of a volume to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub attached_host: Option<String>,
    pub status: AttachStatus,
    #[serde(default)]
    pub attached_at: Option<DateTime<Utc>>,
}

/// Count of active attachments held by `host`
fn active_attachments(attachments: &[AttachmentRecord], host: &str) -> usize {
    attachments
        .iter()
        .filter(|a| a.status == AttachStatus::Attached && a.attached_host.as_deref() == Some(host))
        .count()
}

/// Platform volume backed by an array LUN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    pub id: String,
    pub lun_id: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
}

impl VolumeRef {
    pub fn new(id: impl Into<String>, lun_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            lun_id: lun_id.into(),
            attachments: Vec::new(),
        }
    }

    /// More than one live attachment to the same connector host
    pub fn is_multiattached_to(&self, host: &str) -> bool {
        active_attachments(&self.attachments, host) > 1
    }
}

/// Platform snapshot backed by an array snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: String,
    pub snap_id: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
}

impl SnapshotRef {
    pub fn new(id: impl Into<String>, snap_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            snap_id: snap_id.into(),
            attachments: Vec::new(),
        }
    }

    pub fn is_multiattached_to(&self, host: &str) -> bool {
        active_attachments(&self.attachments, host) > 1
    }
}

// =============================================================================
// Zoning
// =============================================================================

/// Per-fabric view returned by a zone lookup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricMapping {
    pub initiator_port_wwn_list: Vec<String>,
    pub target_port_wwn_list: Vec<String>,
}

/// Zone lookup result keyed by SAN name
pub type ZoneMapping = BTreeMap<String, FabricMapping>;

/// Initiator-target zoning descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FcZoneInfo {
    pub target_wwn: Vec<String>,
    pub initiator_target_map: BTreeMap<String, Vec<String>>,
}

// =============================================================================
// Connection Descriptors
// =============================================================================

/// iSCSI connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiConnectionData {
    pub target_discovered: bool,
    pub target_iqn: String,
    pub target_portal: String,
    pub target_lun: u32,
    pub target_iqns: Vec<String>,
    pub target_portals: Vec<String>,
    pub target_luns: Vec<u32>,
    pub volume_id: String,
}

/// Fibre Channel connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FcConnectionData {
    pub target_discovered: bool,
    pub target_lun: u32,
    pub target_wwn: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_target_map: Option<BTreeMap<String, Vec<String>>>,
    pub volume_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionData {
    Iscsi(IscsiConnectionData),
    Fc(FcConnectionData),
}

/// Connection descriptor returned by a successful attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub driver_volume_type: String,
    pub data: ConnectionData,
}

impl ConnectionInfo {
    pub fn iscsi(data: IscsiConnectionData) -> Self {
        Self {
            driver_volume_type: Protocol::Iscsi.driver_volume_type().to_string(),
            data: ConnectionData::Iscsi(data),
        }
    }

    pub fn fc(data: FcConnectionData) -> Self {
        Self {
            driver_volume_type: Protocol::Fc.driver_volume_type().to_string(),
            data: ConnectionData::Fc(data),
        }
    }

    pub fn target_lun(&self) -> u32 {
        match &self.data {
            ConnectionData::Iscsi(d) => d.target_lun,
            ConnectionData::Fc(d) => d.target_lun,
        }
    }
}

/// Payload returned by a detach
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateData {
    /// Zone to deprovision, set only when the host lost its last mapping
    #[serde(flatten)]
    pub zone: Option<FcZoneInfo>,
}

/// Detach result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateInfo {
    pub driver_volume_type: String,
    pub data: TerminateData,
}

impl TerminateInfo {
    pub fn empty(protocol: Protocol) -> Self {
        Self {
            driver_volume_type: protocol.driver_volume_type().to_string(),
            data: TerminateData::default(),
        }
    }

    pub fn with_zone(protocol: Protocol, zone: FcZoneInfo) -> Self {
        Self {
            driver_volume_type: protocol.driver_volume_type().to_string(),
            data: TerminateData { zone: Some(zone) },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.zone.is_none()
    }
}
