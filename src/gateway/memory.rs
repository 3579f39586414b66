//! In-Memory Array Gateway
//!
//! Simulates the array object model in process. Used by standalone mode and
//! by the attachment tests, which rely on three extras the real array does
//! not offer: a log of every mutating call, one-shot or sticky failure
//! injection per operation, and control over which HLU a new mapping gets.

use crate::domain::model::{
    AccessMask, Host, HostAccess, HostLunMapping, HostLunQuery, HostLunType, Initiator,
    InitiatorPath, Lun, LunSpec, Protocol, Snapshot, StorageProcessor, TargetAddress, TargetPort,
};
use crate::domain::ports::{ArrayGateway, ArrayResult};
use crate::error::{ArrayError, ArrayErrorKind};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

// =============================================================================
// Call Log
// =============================================================================

/// A mutating call received by the simulated array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayCall {
    pub operation: &'static str,
    pub target: String,
}

/// What the array does with a LUN's mapping when access is granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingBehavior {
    /// Lowest free HLU on the host
    Allocate,
    /// Fixed HLU
    Fixed(u32),
    /// Mapping exists but carries no HLU
    NoHlu,
    /// Grant succeeds but no mapping becomes visible
    Hidden,
}

// =============================================================================
// Array State
// =============================================================================

#[derive(Debug, Clone)]
struct HostRecord {
    id: String,
    name: String,
}

#[derive(Debug, Clone)]
struct LunRecord {
    id: String,
    name: String,
    owner: StorageProcessor,
    cg_id: Option<String>,
    host_access: Vec<HostAccess>,
}

#[derive(Debug, Clone)]
struct SnapRecord {
    id: String,
    name: String,
    lun_id: String,
    attached_host: Option<String>,
}

#[derive(Debug, Clone)]
struct LoginPath {
    initiator_uid: String,
    port_id: String,
    logged_in: bool,
}

#[derive(Debug, Default)]
struct ArrayState {
    hosts: BTreeMap<String, HostRecord>,
    initiators: BTreeMap<String, Initiator>,
    luns: BTreeMap<String, LunRecord>,
    snapshots: BTreeMap<String, SnapRecord>,
    mappings: BTreeMap<String, HostLunMapping>,
    ports: Vec<TargetPort>,
    paths: Vec<LoginPath>,
    behaviors: HashMap<String, MappingBehavior>,
}

impl ArrayState {
    fn host_view(&self, record: &HostRecord) -> Host {
        Host {
            id: record.id.clone(),
            name: record.name.clone(),
            initiators: self
                .initiators
                .values()
                .filter(|i| i.host_id.as_deref() == Some(record.id.as_str()))
                .cloned()
                .collect(),
            host_luns: self
                .mappings
                .values()
                .filter(|m| m.host_id == record.id)
                .map(|m| m.id.clone())
                .collect(),
        }
    }

    fn lun_view(record: &LunRecord) -> Lun {
        Lun {
            id: record.id.clone(),
            name: record.name.clone(),
            current_owner: record.owner,
            host_access: record.host_access.clone(),
            cg_id: record.cg_id.clone(),
        }
    }

    fn snap_view(record: &SnapRecord) -> Snapshot {
        Snapshot {
            id: record.id.clone(),
            name: record.name.clone(),
            lun_id: record.lun_id.clone(),
            host_access: record
                .attached_host
                .iter()
                .map(|h| HostAccess::new(h.clone(), AccessMask::Production))
                .collect(),
        }
    }

    fn mapping_id(host_id: &str, lun_id: &str, snap_id: Option<&str>) -> String {
        match snap_id {
            Some(snap) => format!("{}_{}_snap_{}", host_id, lun_id, snap),
            None => format!("{}_{}_prod", host_id, lun_id),
        }
    }

    fn free_hlu(&self, host_id: &str) -> u32 {
        let used: BTreeSet<u32> = self
            .mappings
            .values()
            .filter(|m| m.host_id == host_id)
            .filter_map(|m| m.hlu)
            .collect();
        (0..).find(|h| !used.contains(h)).unwrap_or(0)
    }

    fn map(&mut self, host_id: &str, lun_id: &str, snap_id: Option<&str>) {
        let id = Self::mapping_id(host_id, lun_id, snap_id);
        if self.mappings.contains_key(&id) {
            return;
        }
        let behavior = self
            .behaviors
            .get(lun_id)
            .copied()
            .unwrap_or(MappingBehavior::Allocate);
        let hlu = match behavior {
            MappingBehavior::Hidden => return,
            MappingBehavior::NoHlu => None,
            MappingBehavior::Fixed(hlu) => Some(hlu),
            MappingBehavior::Allocate => Some(self.free_hlu(host_id)),
        };
        self.mappings.insert(
            id.clone(),
            HostLunMapping {
                id,
                host_id: host_id.to_string(),
                lun_id: lun_id.to_string(),
                snap_id: snap_id.map(str::to_string),
                lun_type: if snap_id.is_some() {
                    HostLunType::LunSnap
                } else {
                    HostLunType::Lun
                },
                hlu,
            },
        );
    }

    fn unmap(&mut self, host_id: &str, lun_id: &str, snap_id: Option<&str>) {
        self.mappings
            .remove(&Self::mapping_id(host_id, lun_id, snap_id));
    }
}

// =============================================================================
// In-Memory Array
// =============================================================================

/// Simulated array implementing [`ArrayGateway`]
pub struct InMemoryArray {
    state: RwLock<ArrayState>,
    calls: Mutex<Vec<ArrayCall>>,
    /// operation -> (kind, sticky)
    failures: Mutex<HashMap<String, (ArrayErrorKind, bool)>>,
    next_id: AtomicU64,
}

impl Default for InMemoryArray {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryArray {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ArrayState::default()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, operation: &'static str, target: impl Into<String>) {
        let target = target.into();
        debug!("in-memory array: {} {}", operation, target);
        self.calls.lock().push(ArrayCall { operation, target });
    }

    fn injected(&self, operation: &str) -> ArrayResult<()> {
        let mut failures = self.failures.lock();
        if let Some((kind, sticky)) = failures.get(operation).copied() {
            if !sticky {
                failures.remove(operation);
            }
            return Err(ArrayError::of_kind(
                kind,
                format!("injected failure for {}", operation),
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    pub fn add_host(&self, name: &str) -> String {
        let id = format!("Host_{}", self.next_id());
        self.state.write().hosts.insert(
            id.clone(),
            HostRecord {
                id: id.clone(),
                name: name.to_string(),
            },
        );
        id
    }

    pub fn add_initiator(&self, uid: &str, protocol: Protocol, host_id: Option<&str>) -> String {
        let id = format!("HostInitiator_{}", self.next_id());
        self.state.write().initiators.insert(
            id.clone(),
            Initiator {
                id: id.clone(),
                uid: uid.to_string(),
                protocol,
                host_id: host_id.map(str::to_string),
            },
        );
        id
    }

    pub fn add_lun(&self, name: &str, owner: StorageProcessor) -> String {
        let id = format!("sv_{}", self.next_id());
        self.state.write().luns.insert(
            id.clone(),
            LunRecord {
                id: id.clone(),
                name: name.to_string(),
                owner,
                cg_id: None,
                host_access: Vec::new(),
            },
        );
        id
    }

    pub fn set_lun_group(&self, lun_id: &str, cg_id: &str) {
        if let Some(lun) = self.state.write().luns.get_mut(lun_id) {
            lun.cg_id = Some(cg_id.to_string());
        }
    }

    pub fn add_snapshot(&self, lun_id: &str, name: &str) -> String {
        let id = format!("snap_{}", self.next_id());
        self.state.write().snapshots.insert(
            id.clone(),
            SnapRecord {
                id: id.clone(),
                name: name.to_string(),
                lun_id: lun_id.to_string(),
                attached_host: None,
            },
        );
        id
    }

    pub fn add_port(&self, port: TargetPort) {
        self.state.write().ports.push(port);
    }

    /// Record the login state of the initiator with `uid` on `port_id`
    pub fn add_login_path(&self, initiator_uid: &str, port_id: &str, logged_in: bool) {
        self.state.write().paths.push(LoginPath {
            initiator_uid: initiator_uid.to_string(),
            port_id: port_id.to_string(),
            logged_in,
        });
    }

    pub fn set_mapping_behavior(&self, lun_id: &str, behavior: MappingBehavior) {
        self.state
            .write()
            .behaviors
            .insert(lun_id.to_string(), behavior);
    }

    /// Fail the next call to `operation` with `kind`
    pub fn fail_next(&self, operation: &str, kind: ArrayErrorKind) {
        self.failures
            .lock()
            .insert(operation.to_string(), (kind, false));
    }

    /// Fail every call to `operation` with `kind` until cleared
    pub fn fail_always(&self, operation: &str, kind: ArrayErrorKind) {
        self.failures
            .lock()
            .insert(operation.to_string(), (kind, true));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn mutating_calls(&self) -> Vec<ArrayCall> {
        self.calls.lock().clone()
    }

    pub fn count_calls(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn lun(&self, lun_id: &str) -> Option<Lun> {
        self.state.read().luns.get(lun_id).map(ArrayState::lun_view)
    }

    pub fn snapshot(&self, snap_id: &str) -> Option<Snapshot> {
        self.state
            .read()
            .snapshots
            .get(snap_id)
            .map(ArrayState::snap_view)
    }

    pub fn host(&self, host_id: &str) -> Option<Host> {
        let state = self.state.read();
        state.hosts.get(host_id).map(|h| state.host_view(h))
    }

    pub fn host_count(&self) -> usize {
        self.state.read().hosts.len()
    }

    pub fn initiator_count(&self) -> usize {
        self.state.read().initiators.len()
    }
}

fn not_found(kind: &str, id: &str) -> ArrayError {
    ArrayError::of_kind(ArrayErrorKind::NotFound, format!("{} {} does not exist", kind, id))
}

#[async_trait]
impl ArrayGateway for InMemoryArray {
    async fn find_initiator(&self, uid: &str) -> ArrayResult<Option<Initiator>> {
        self.injected("find_initiator")?;
        Ok(self
            .state
            .read()
            .initiators
            .values()
            .find(|i| i.uid.eq_ignore_ascii_case(uid))
            .cloned())
    }

    async fn create_initiator(&self, uid: &str, host_id: &str) -> ArrayResult<Initiator> {
        self.record("create_initiator", uid);
        self.injected("create_initiator")?;

        let mut state = self.state.write();
        if state.initiators.values().any(|i| i.uid.eq_ignore_ascii_case(uid)) {
            return Err(ArrayError::from_response(
                0,
                Some(409),
                format!("initiator {} already exists", uid),
            ));
        }
        if !state.hosts.contains_key(host_id) {
            return Err(not_found("host", host_id));
        }

        let protocol = if uid.to_ascii_lowercase().starts_with("iqn") {
            Protocol::Iscsi
        } else {
            Protocol::Fc
        };
        let initiator = Initiator {
            id: format!("HostInitiator_{}", self.next_id()),
            uid: uid.to_string(),
            protocol,
            host_id: Some(host_id.to_string()),
        };
        state
            .initiators
            .insert(initiator.id.clone(), initiator.clone());
        Ok(initiator)
    }

    async fn register_initiator(&self, initiator_id: &str, host_id: &str) -> ArrayResult<()> {
        self.record("register_initiator", initiator_id);
        self.injected("register_initiator")?;

        let mut state = self.state.write();
        if !state.hosts.contains_key(host_id) {
            return Err(not_found("host", host_id));
        }
        let initiator = state
            .initiators
            .get_mut(initiator_id)
            .ok_or_else(|| not_found("initiator", initiator_id))?;
        initiator.host_id = Some(host_id.to_string());
        Ok(())
    }

    async fn find_host_by_name(&self, name: &str) -> ArrayResult<Option<Host>> {
        self.injected("find_host_by_name")?;
        let state = self.state.read();
        Ok(state
            .hosts
            .values()
            .find(|h| h.name == name)
            .map(|h| state.host_view(h)))
    }

    async fn get_host(&self, host_id: &str) -> ArrayResult<Option<Host>> {
        self.injected("get_host")?;
        let state = self.state.read();
        Ok(state.hosts.get(host_id).map(|h| state.host_view(h)))
    }

    async fn create_host(&self, name: &str) -> ArrayResult<Host> {
        self.record("create_host", name);
        self.injected("create_host")?;
        if name.is_empty() {
            return Err(ArrayError::from_response(
                0,
                Some(422),
                "host name must not be empty",
            ));
        }
        let id = self.add_host(name);
        let state = self.state.read();
        Ok(state.host_view(&state.hosts[&id]))
    }

    async fn get_host_lun_mappings(&self, query: &HostLunQuery) -> ArrayResult<Vec<HostLunMapping>> {
        self.injected("get_host_lun_mappings")?;
        Ok(self
            .state
            .read()
            .mappings
            .values()
            .filter(|m| query.matches(m))
            .cloned()
            .collect())
    }

    async fn get_lun(&self, lun_id: &str) -> ArrayResult<Lun> {
        self.injected("get_lun")?;
        self.lun(lun_id).ok_or_else(|| not_found("lun", lun_id))
    }

    async fn find_lun_by_name(&self, name: &str) -> ArrayResult<Option<Lun>> {
        self.injected("find_lun_by_name")?;
        Ok(self
            .state
            .read()
            .luns
            .values()
            .find(|l| l.name == name)
            .map(ArrayState::lun_view))
    }

    async fn create_lun(&self, spec: &LunSpec) -> ArrayResult<Lun> {
        self.record("create_lun", &spec.name);
        self.injected("create_lun")?;
        if self.state.read().luns.values().any(|l| l.name == spec.name) {
            return Err(ArrayError::of_kind(
                ArrayErrorKind::NameInUse,
                format!("LUN name {} in use", spec.name),
            ));
        }
        let id = self.add_lun(&spec.name, StorageProcessor::A);
        self.lun(&id).ok_or_else(|| not_found("lun", &id))
    }

    async fn get_snapshot(&self, snap_id: &str) -> ArrayResult<Snapshot> {
        self.injected("get_snapshot")?;
        self.snapshot(snap_id)
            .ok_or_else(|| not_found("snap", snap_id))
    }

    async fn modify_lun_access(
        &self,
        lun_id: &str,
        cg_id: Option<&str>,
        access: &[HostAccess],
    ) -> ArrayResult<()> {
        self.record("modify_lun_access", lun_id);
        self.injected("modify_lun_access")?;

        let mut state = self.state.write();
        let lun = state
            .luns
            .get(lun_id)
            .cloned()
            .ok_or_else(|| not_found("lun", lun_id))?;
        if lun.cg_id.as_deref() != cg_id {
            return Err(ArrayError::from_response(
                0,
                Some(422),
                format!("LUN {} must be modified through its consistency group", lun_id),
            ));
        }

        // No-access entries are not kept on the LUN
        let granted: Vec<HostAccess> = access
            .iter()
            .filter(|a| a.access_mask != AccessMask::NoAccess)
            .cloned()
            .collect();
        if granted == lun.host_access {
            return Err(ArrayError::of_kind(
                ArrayErrorKind::NothingToModify,
                format!("nothing to modify on {}", lun_id),
            ));
        }

        for old in &lun.host_access {
            if !granted.iter().any(|a| a.host_id == old.host_id) {
                state.unmap(&old.host_id, lun_id, None);
            }
        }
        for new in &granted {
            state.map(&new.host_id, lun_id, None);
        }
        if let Some(record) = state.luns.get_mut(lun_id) {
            record.host_access = granted;
        }
        Ok(())
    }

    async fn attach_snapshot(&self, snap_id: &str, host_id: &str) -> ArrayResult<()> {
        self.record("attach_snapshot", snap_id);
        self.injected("attach_snapshot")?;

        let mut state = self.state.write();
        let snap = state
            .snapshots
            .get(snap_id)
            .cloned()
            .ok_or_else(|| not_found("snap", snap_id))?;
        if snap.attached_host.is_some() {
            return Err(ArrayError::of_kind(
                ArrayErrorKind::SnapAlreadyAttached,
                format!("snap {} is already attached", snap_id),
            ));
        }
        state.map(host_id, &snap.lun_id, Some(snap_id));
        if let Some(record) = state.snapshots.get_mut(snap_id) {
            record.attached_host = Some(host_id.to_string());
        }
        Ok(())
    }

    async fn detach_snapshot(&self, snap_id: &str) -> ArrayResult<()> {
        self.record("detach_snapshot", snap_id);
        self.injected("detach_snapshot")?;

        let mut state = self.state.write();
        let snap = state
            .snapshots
            .get(snap_id)
            .cloned()
            .ok_or_else(|| not_found("snap", snap_id))?;
        if let Some(host_id) = &snap.attached_host {
            state.unmap(host_id, &snap.lun_id, Some(snap_id));
        }
        if let Some(record) = state.snapshots.get_mut(snap_id) {
            record.attached_host = None;
        }
        Ok(())
    }

    async fn get_fc_login_paths(&self, initiator_id: &str) -> ArrayResult<Vec<InitiatorPath>> {
        self.injected("get_fc_login_paths")?;
        let state = self.state.read();
        let uid = match state.initiators.get(initiator_id) {
            Some(i) => i.uid.clone(),
            None => return Ok(Vec::new()),
        };
        Ok(state
            .paths
            .iter()
            .filter(|p| p.initiator_uid.eq_ignore_ascii_case(&uid))
            .map(|p| InitiatorPath {
                initiator_id: initiator_id.to_string(),
                port_id: p.port_id.clone(),
                is_logged_in: p.logged_in,
            })
            .collect())
    }

    async fn get_target_ports(&self, protocol: Protocol) -> ArrayResult<Vec<TargetPort>> {
        self.injected("get_target_ports")?;
        Ok(self
            .state
            .read()
            .ports
            .iter()
            .filter(|p| {
                matches!(
                    (&p.address, protocol),
                    (TargetAddress::Iscsi { .. }, Protocol::Iscsi)
                        | (TargetAddress::Fc { .. }, Protocol::Fc)
                )
            })
            .cloned()
            .collect())
    }

    fn gateway_name(&self) -> &str {
        "in-memory"
    }
}
