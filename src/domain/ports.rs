//! Domain Ports - Capabilities consumed by the attachment engine
//!
//! The array gateway is the typed view of the storage array's object model.
//! Expected array-side failures come back as [`ArrayError`] values, never as
//! panics; the component issuing the call decides whether a given
//! [`crate::error::ArrayErrorKind`] is absorbed or fatal.

use crate::domain::model::{
    Host, HostAccess, HostLunMapping, HostLunQuery, Initiator, InitiatorPath, Lun, LunSpec,
    Protocol, Snapshot, TargetPort, ZoneMapping,
};
use crate::error::{ArrayError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Result of a single gateway call
pub type ArrayResult<T> = std::result::Result<T, ArrayError>;

// =============================================================================
// Array Gateway Port
// =============================================================================

/// Typed operations against the array's management API
#[async_trait]
pub trait ArrayGateway: Send + Sync {
    /// Look up an initiator by IQN or WWN
    async fn find_initiator(&self, uid: &str) -> ArrayResult<Option<Initiator>>;

    /// Create an initiator bound to `host_id`
    async fn create_initiator(&self, uid: &str, host_id: &str) -> ArrayResult<Initiator>;

    /// Bind an existing initiator to `host_id`
    async fn register_initiator(&self, initiator_id: &str, host_id: &str) -> ArrayResult<()>;

    async fn find_host_by_name(&self, name: &str) -> ArrayResult<Option<Host>>;

    async fn get_host(&self, host_id: &str) -> ArrayResult<Option<Host>>;

    async fn create_host(&self, name: &str) -> ArrayResult<Host>;

    /// Host-LUN mappings matching the query
    async fn get_host_lun_mappings(&self, query: &HostLunQuery) -> ArrayResult<Vec<HostLunMapping>>;

    async fn get_lun(&self, lun_id: &str) -> ArrayResult<Lun>;

    async fn find_lun_by_name(&self, name: &str) -> ArrayResult<Option<Lun>>;

    async fn create_lun(&self, spec: &LunSpec) -> ArrayResult<Lun>;

    async fn get_snapshot(&self, snap_id: &str) -> ArrayResult<Snapshot>;

    /// Replace the LUN's host access list, through its consistency group when
    /// `cg_id` is set
    async fn modify_lun_access(
        &self,
        lun_id: &str,
        cg_id: Option<&str>,
        access: &[HostAccess],
    ) -> ArrayResult<()>;

    /// Grant read-write access on the snapshot to exactly one host
    async fn attach_snapshot(&self, snap_id: &str, host_id: &str) -> ArrayResult<()>;

    async fn detach_snapshot(&self, snap_id: &str) -> ArrayResult<()>;

    /// Path status of an FC initiator against every array port
    async fn get_fc_login_paths(&self, initiator_id: &str) -> ArrayResult<Vec<InitiatorPath>>;

    async fn get_target_ports(&self, protocol: Protocol) -> ArrayResult<Vec<TargetPort>>;

    /// Gateway name for logging
    fn gateway_name(&self) -> &str;
}

// =============================================================================
// Zone Lookup Port
// =============================================================================

/// SAN fabric lookup used to build initiator-target maps
#[async_trait]
pub trait ZoneLookup: Send + Sync {
    /// Fabric view of which initiators can reach which targets
    async fn get_device_mapping(
        &self,
        initiator_wwns: &[String],
        target_wwns: &[String],
    ) -> Result<ZoneMapping>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ArrayGatewayRef = Arc<dyn ArrayGateway>;
pub type ZoneLookupRef = Arc<dyn ZoneLookup>;
