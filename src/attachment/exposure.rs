//! Exposure Manager
//!
//! Grants and revokes host access to LUNs and snapshots.
//!
//! LUN access is a read-modify-write of the LUN's host-access list: the
//! host's existing entry is replaced, never duplicated. The list is re-read
//! inside the host lock so concurrent grants for the same host cannot lose
//! each other's changes.
//!
//! "Nothing to modify" on a LUN and "already attached" on a snapshot are
//! success. Every other array error is fatal and surfaces as
//! [`Error::Exposure`]. A snapshot held by another host is never taken
//! over.

use super::locks::HostLocks;
use crate::domain::model::{AccessMask, HostAccess, Lun};
use crate::domain::ports::ArrayGatewayRef;
use crate::error::{ArrayError, ArrayErrorKind, Error, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// State displaced by a grant, used to compensate it exactly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExposureReceipt {
    Lun {
        lun_id: String,
        host_id: String,
        /// Entry the host held before the grant
        prior: Option<HostAccess>,
    },
    Snapshot {
        snap_id: String,
        host_id: String,
        /// Snapshot was already attached to this host
        was_attached: bool,
    },
}

impl ExposureReceipt {
    pub fn host_id(&self) -> &str {
        match self {
            ExposureReceipt::Lun { host_id, .. } | ExposureReceipt::Snapshot { host_id, .. } => {
                host_id
            }
        }
    }
}

/// Access list of `lun` with the entry for `host_id` replaced by `mask`
fn replace_host_access(lun: &Lun, host_id: &str, mask: AccessMask) -> Vec<HostAccess> {
    let mut access: Vec<HostAccess> = lun
        .host_access
        .iter()
        .filter(|a| a.host_id != host_id)
        .cloned()
        .collect();
    access.push(HostAccess::new(host_id, mask));
    access
}

pub struct ExposureManager {
    gateway: ArrayGatewayRef,
    locks: Arc<HostLocks>,
}

impl ExposureManager {
    pub fn new(gateway: ArrayGatewayRef, locks: Arc<HostLocks>) -> Self {
        Self { gateway, locks }
    }

    async fn fetch_lun(&self, lun_id: &str) -> Result<Lun> {
        self.gateway
            .get_lun(lun_id)
            .await
            .map_err(|e| Error::lookup("get_lun", "lun", lun_id, e))
    }

    /// Set the access of `host_id` on `lun_id`, returning the entry it replaced
    async fn set_access(
        &self,
        action: &'static str,
        lun_id: &str,
        host_id: &str,
        mask: AccessMask,
    ) -> Result<Option<HostAccess>> {
        let _guard = self.locks.acquire(host_id).await;

        let lun = self.fetch_lun(lun_id).await?;
        let prior = lun.access_for(host_id).cloned();
        let access = replace_host_access(&lun, host_id, mask);

        match self
            .gateway
            .modify_lun_access(&lun.id, lun.cg_id.as_deref(), &access)
            .await
        {
            Ok(()) => {
                debug!("Set {:?} access for {} on {}", mask, host_id, lun_id);
                Ok(prior)
            }
            Err(e) if e.is(ArrayErrorKind::NothingToModify) => {
                warn!(
                    "LUN {} ({}) already had {:?} access for {}",
                    lun_id, lun.name, mask, host_id
                );
                Ok(prior)
            }
            Err(e) => {
                error!("Failed to {} {} for {}: {}", action, lun_id, host_id, e);
                Err(Error::Exposure {
                    action,
                    resource: lun_id.to_string(),
                    host_id: host_id.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Grant `mask` access on a LUN to a host
    pub async fn expose_lun(
        &self,
        lun_id: &str,
        host_id: &str,
        mask: AccessMask,
    ) -> Result<ExposureReceipt> {
        let prior = self.set_access("expose", lun_id, host_id, mask).await?;
        info!("Exposed {} to {}", lun_id, host_id);
        Ok(ExposureReceipt::Lun {
            lun_id: lun_id.to_string(),
            host_id: host_id.to_string(),
            prior,
        })
    }

    /// Revoke a host's access to a LUN
    pub async fn revoke_lun(&self, lun_id: &str, host_id: &str) -> Result<()> {
        self.set_access("hide", lun_id, host_id, AccessMask::NoAccess)
            .await?;
        info!("Hid {} from {}", lun_id, host_id);
        Ok(())
    }

    /// Remove every host's access to a LUN
    pub async fn revoke_all(&self, lun_id: &str) -> Result<()> {
        let lun = self.fetch_lun(lun_id).await?;
        match self
            .gateway
            .modify_lun_access(&lun.id, lun.cg_id.as_deref(), &[])
            .await
        {
            Ok(()) => {}
            Err(e) if e.is(ArrayErrorKind::NothingToModify) => {
                debug!("LUN {} had no host access", lun_id);
            }
            Err(e) => {
                return Err(Error::Exposure {
                    action: "hide",
                    resource: lun_id.to_string(),
                    host_id: "*".to_string(),
                    source: e,
                })
            }
        }
        info!("Hid {} from all hosts", lun_id);
        Ok(())
    }

    /// Attach a snapshot to a host
    pub async fn attach_snapshot(&self, snap_id: &str, host_id: &str) -> Result<ExposureReceipt> {
        let _guard = self.locks.acquire(host_id).await;

        let snapshot = self
            .gateway
            .get_snapshot(snap_id)
            .await
            .map_err(|e| Error::lookup("get_snapshot", "snapshot", snap_id, e))?;
        // A snapshot is attached to at most one host
        if let Some(holder) = snapshot.attached_host().filter(|h| *h != host_id) {
            error!("Snapshot {} is attached to {}, refusing {}", snap_id, holder, host_id);
            return Err(Error::Exposure {
                action: "attach",
                resource: snap_id.to_string(),
                host_id: host_id.to_string(),
                source: ArrayError::of_kind(
                    ArrayErrorKind::SnapAlreadyAttached,
                    format!("snapshot {} is attached to {}", snap_id, holder),
                ),
            });
        }
        let was_attached = snapshot.attached_host().is_some();

        match self.gateway.attach_snapshot(snap_id, host_id).await {
            Ok(()) => info!("Attached {} to {}", snap_id, host_id),
            Err(e) if e.is(ArrayErrorKind::SnapAlreadyAttached) => {
                warn!("Snapshot {} had been attached to {}", snap_id, host_id);
            }
            Err(e) => {
                error!("Failed to attach {} to {}: {}", snap_id, host_id, e);
                return Err(Error::Exposure {
                    action: "attach",
                    resource: snap_id.to_string(),
                    host_id: host_id.to_string(),
                    source: e,
                });
            }
        }

        Ok(ExposureReceipt::Snapshot {
            snap_id: snap_id.to_string(),
            host_id: host_id.to_string(),
            was_attached,
        })
    }

    /// Detach a snapshot from whichever host holds it
    pub async fn detach_snapshot(&self, snap_id: &str) -> Result<()> {
        self.gateway.detach_snapshot(snap_id).await.map_err(|e| {
            error!("Failed to detach {}: {}", snap_id, e);
            Error::Exposure {
                action: "detach",
                resource: snap_id.to_string(),
                host_id: "*".to_string(),
                source: e,
            }
        })?;
        info!("Detached {}", snap_id);
        Ok(())
    }

    /// Undo a grant, putting back what it displaced
    pub async fn restore(&self, receipt: &ExposureReceipt) -> Result<()> {
        match receipt {
            ExposureReceipt::Lun {
                lun_id,
                host_id,
                prior,
            } => {
                let mask = prior
                    .as_ref()
                    .map(|p| p.access_mask)
                    .unwrap_or(AccessMask::NoAccess);
                warn!("Reverting access of {} on {} to {:?}", host_id, lun_id, mask);
                self.set_access("revert", lun_id, host_id, mask)
                    .await
                    .map(|_| ())
            }
            ExposureReceipt::Snapshot {
                snap_id,
                host_id,
                was_attached,
            } => {
                if *was_attached {
                    debug!("Snapshot {} stays attached to {}", snap_id, host_id);
                    return Ok(());
                }
                warn!("Reverting attachment of {} to {}", snap_id, host_id);
                self.detach_snapshot(snap_id).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{
        Host, HostLunMapping, HostLunQuery, Initiator, InitiatorPath, LunSpec, Protocol,
        Snapshot, StorageProcessor, TargetPort,
    };
    use crate::domain::ports::{ArrayGateway, ArrayResult};
    use crate::gateway::memory::InMemoryArray;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delegates to an in-memory array, yielding between reading a LUN and
    /// writing its access list and tracking how many such spans overlap
    struct InterleavingArray {
        inner: Arc<InMemoryArray>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl InterleavingArray {
        fn new(inner: Arc<InMemoryArray>) -> Self {
            Self {
                inner,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ArrayGateway for InterleavingArray {
        async fn find_initiator(&self, uid: &str) -> ArrayResult<Option<Initiator>> {
            self.inner.find_initiator(uid).await
        }
        async fn create_initiator(&self, uid: &str, host_id: &str) -> ArrayResult<Initiator> {
            self.inner.create_initiator(uid, host_id).await
        }
        async fn register_initiator(&self, initiator_id: &str, host_id: &str) -> ArrayResult<()> {
            self.inner.register_initiator(initiator_id, host_id).await
        }
        async fn find_host_by_name(&self, name: &str) -> ArrayResult<Option<Host>> {
            self.inner.find_host_by_name(name).await
        }
        async fn get_host(&self, host_id: &str) -> ArrayResult<Option<Host>> {
            self.inner.get_host(host_id).await
        }
        async fn create_host(&self, name: &str) -> ArrayResult<Host> {
            self.inner.create_host(name).await
        }
        async fn get_host_lun_mappings(&self, query: &HostLunQuery) -> ArrayResult<Vec<HostLunMapping>> {
            self.inner.get_host_lun_mappings(query).await
        }
        async fn get_lun(&self, lun_id: &str) -> ArrayResult<Lun> {
            let lun = self.inner.get_lun(lun_id).await?;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            Ok(lun)
        }
        async fn find_lun_by_name(&self, name: &str) -> ArrayResult<Option<Lun>> {
            self.inner.find_lun_by_name(name).await
        }
        async fn create_lun(&self, spec: &LunSpec) -> ArrayResult<Lun> {
            self.inner.create_lun(spec).await
        }
        async fn get_snapshot(&self, snap_id: &str) -> ArrayResult<Snapshot> {
            self.inner.get_snapshot(snap_id).await
        }
        async fn modify_lun_access(
            &self,
            lun_id: &str,
            cg_id: Option<&str>,
            access: &[HostAccess],
        ) -> ArrayResult<()> {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.modify_lun_access(lun_id, cg_id, access).await
        }
        async fn attach_snapshot(&self, snap_id: &str, host_id: &str) -> ArrayResult<()> {
            self.inner.attach_snapshot(snap_id, host_id).await
        }
        async fn detach_snapshot(&self, snap_id: &str) -> ArrayResult<()> {
            self.inner.detach_snapshot(snap_id).await
        }
        async fn get_fc_login_paths(&self, initiator_id: &str) -> ArrayResult<Vec<InitiatorPath>> {
            self.inner.get_fc_login_paths(initiator_id).await
        }
        async fn get_target_ports(&self, protocol: Protocol) -> ArrayResult<Vec<TargetPort>> {
            self.inner.get_target_ports(protocol).await
        }
        fn gateway_name(&self) -> &str {
            "interleaving"
        }
    }

    /// Expose `luns` to one host concurrently, returning the peak overlap
    async fn expose_concurrently(locked: bool, luns: usize) -> (Arc<InMemoryArray>, String, Vec<String>, usize) {
        let array = Arc::new(InMemoryArray::new());
        let host = array.add_host("h1");
        let other = array.add_host("h2");
        let lun_ids: Vec<String> = (0..luns)
            .map(|i| array.add_lun(&format!("vol-{}", i), StorageProcessor::A))
            .collect();
        for lun in &lun_ids {
            array
                .modify_lun_access(lun, None, &[HostAccess::new(other.clone(), AccessMask::Production)])
                .await
                .unwrap();
        }

        let gateway = Arc::new(InterleavingArray::new(array.clone()));
        let manager = ExposureManager::new(gateway.clone(), Arc::new(HostLocks::new(locked)));
        let grants = lun_ids
            .iter()
            .map(|lun| manager.expose_lun(lun, &host, AccessMask::Production));
        for receipt in join_all(grants).await {
            receipt.unwrap();
        }
        let peak = gateway.peak.load(Ordering::SeqCst);
        (array, host, lun_ids, peak)
    }

    fn setup() -> (Arc<InMemoryArray>, ExposureManager) {
        let array = Arc::new(InMemoryArray::new());
        let manager = ExposureManager::new(array.clone(), Arc::new(HostLocks::new(true)));
        (array, manager)
    }

    #[tokio::test]
    async fn test_expose_replaces_host_entry() {
        let (array, manager) = setup();
        let h1 = array.add_host("h1");
        let h2 = array.add_host("h2");
        let lun = array.add_lun("vol", StorageProcessor::A);

        manager
            .expose_lun(&lun, &h1, AccessMask::Production)
            .await
            .unwrap();
        manager
            .expose_lun(&lun, &h2, AccessMask::Production)
            .await
            .unwrap();
        let receipt = manager
            .expose_lun(&lun, &h1, AccessMask::Both)
            .await
            .unwrap();

        let access = array.lun(&lun).unwrap().host_access;
        assert_eq!(access.len(), 2);
        assert_eq!(access.iter().filter(|a| a.host_id == h1).count(), 1);
        assert_eq!(
            receipt,
            ExposureReceipt::Lun {
                lun_id: lun.clone(),
                host_id: h1.clone(),
                prior: Some(HostAccess::new(h1.clone(), AccessMask::Production)),
            }
        );
    }

    #[tokio::test]
    async fn test_nothing_to_modify_is_absorbed() {
        let (array, manager) = setup();
        let host = array.add_host("h1");
        let lun = array.add_lun("vol", StorageProcessor::A);

        manager.expose_lun(&lun, &host, AccessMask::Production).await.unwrap();
        manager.expose_lun(&lun, &host, AccessMask::Production).await.unwrap();
        manager.revoke_lun(&lun, &host).await.unwrap();
        manager.revoke_lun(&lun, &host).await.unwrap();
        assert!(array.lun(&lun).unwrap().host_access.is_empty());
    }

    #[tokio::test]
    async fn test_group_member_modified_through_group() {
        let (array, manager) = setup();
        let host = array.add_host("h1");
        let lun = array.add_lun("vol", StorageProcessor::A);
        array.set_lun_group(&lun, "res_1");

        manager.expose_lun(&lun, &host, AccessMask::Production).await.unwrap();
        assert_eq!(array.lun(&lun).unwrap().host_access.len(), 1);
    }

    #[tokio::test]
    async fn test_other_errors_are_fatal() {
        let (array, manager) = setup();
        let host = array.add_host("h1");
        let lun = array.add_lun("vol", StorageProcessor::A);
        array.fail_next("modify_lun_access", ArrayErrorKind::Unknown);

        let err = manager
            .expose_lun(&lun, &host, AccessMask::Production)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Exposure { action: "expose", .. });
    }

    #[tokio::test]
    async fn test_restore_puts_back_prior_entry() {
        let (array, manager) = setup();
        let host = array.add_host("h1");
        let lun = array.add_lun("vol", StorageProcessor::A);

        let first = manager.expose_lun(&lun, &host, AccessMask::Production).await.unwrap();
        let second = manager.expose_lun(&lun, &host, AccessMask::Both).await.unwrap();

        manager.restore(&second).await.unwrap();
        assert_eq!(
            array.lun(&lun).unwrap().access_for(&host).map(|a| a.access_mask),
            Some(AccessMask::Production)
        );

        manager.restore(&first).await.unwrap();
        assert!(array.lun(&lun).unwrap().host_access.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_attach_is_idempotent() {
        let (array, manager) = setup();
        let host = array.add_host("h1");
        let lun = array.add_lun("vol", StorageProcessor::A);
        let snap = array.add_snapshot(&lun, "snap");

        let first = manager.attach_snapshot(&snap, &host).await.unwrap();
        let second = manager.attach_snapshot(&snap, &host).await.unwrap();
        assert_matches!(first, ExposureReceipt::Snapshot { was_attached: false, .. });
        assert_matches!(second, ExposureReceipt::Snapshot { was_attached: true, .. });

        // Compensating the retry leaves the earlier attachment alone
        manager.restore(&second).await.unwrap();
        assert_eq!(array.snapshot(&snap).unwrap().attached_host(), Some(host.as_str()));

        manager.restore(&first).await.unwrap();
        assert_eq!(array.snapshot(&snap).unwrap().attached_host(), None);
    }

    #[tokio::test]
    async fn test_snapshot_held_by_other_host_is_refused() {
        let (array, manager) = setup();
        let h1 = array.add_host("h1");
        let h2 = array.add_host("h2");
        let lun = array.add_lun("vol", StorageProcessor::A);
        let snap = array.add_snapshot(&lun, "snap");
        manager.attach_snapshot(&snap, &h2).await.unwrap();
        array.clear_calls();

        let err = manager.attach_snapshot(&snap, &h1).await.unwrap_err();
        assert_matches!(err, Error::Exposure { action: "attach", .. });
        assert_eq!(array.count_calls("attach_snapshot"), 0);
        assert_eq!(array.snapshot(&snap).unwrap().attached_host(), Some(h2.as_str()));
    }

    #[tokio::test]
    async fn test_host_lock_covers_read_modify_write() {
        let (array, host, luns, peak) = expose_concurrently(true, 6).await;
        assert_eq!(peak, 1);
        for lun in &luns {
            let access = array.lun(lun).unwrap().host_access;
            assert_eq!(access.len(), 2);
            assert!(access.iter().any(|a| a.host_id == host));
        }
    }

    #[tokio::test]
    async fn test_unlocked_exposures_interleave() {
        let (_array, _host, _luns, peak) = expose_concurrently(false, 6).await;
        assert!(peak > 1);
    }

    #[tokio::test]
    async fn test_revoke_all_clears_access() {
        let (array, manager) = setup();
        let h1 = array.add_host("h1");
        let h2 = array.add_host("h2");
        let lun = array.add_lun("vol", StorageProcessor::A);
        manager.expose_lun(&lun, &h1, AccessMask::Production).await.unwrap();
        manager.expose_lun(&lun, &h2, AccessMask::Production).await.unwrap();

        manager.revoke_all(&lun).await.unwrap();
        assert!(array.lun(&lun).unwrap().host_access.is_empty());
        manager.revoke_all(&lun).await.unwrap();
    }
}
