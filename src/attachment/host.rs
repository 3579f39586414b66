//! Host Resolver
//!
//! Finds or creates the array host for a connector and makes sure every one
//! of the connector's initiators is bound to it.

use super::classifier::{Classification, InitiatorClassifier};
use super::exposure::ExposureManager;
use crate::config::DummyLunConfig;
use crate::domain::model::{AccessMask, Connector, Host, Initiator, Lun, LunSpec};
use crate::domain::ports::ArrayGatewayRef;
use crate::error::{ArrayErrorKind, Error, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct HostResolver {
    gateway: ArrayGatewayRef,
    classifier: InitiatorClassifier,
    exposure: Arc<ExposureManager>,
    dummy_lun: Option<DummyLunConfig>,
}

impl HostResolver {
    pub fn new(
        gateway: ArrayGatewayRef,
        classifier: InitiatorClassifier,
        exposure: Arc<ExposureManager>,
        dummy_lun: Option<DummyLunConfig>,
    ) -> Self {
        Self {
            gateway,
            classifier,
            exposure,
            dummy_lun,
        }
    }

    /// Host bound to a registered initiator, else the host named by the connector
    async fn extract_host(
        &self,
        classification: &Classification,
        name: &str,
    ) -> Result<Option<Host>> {
        if let Some(host_id) = classification.registered_host() {
            let host = self
                .gateway
                .get_host(host_id)
                .await
                .map_err(|e| Error::array("get_host", host_id, e))?;
            if host.is_some() {
                return Ok(host);
            }
            warn!("Host {} of a registered initiator is gone", host_id);
        }

        if name.is_empty() {
            return Ok(None);
        }
        self.gateway
            .find_host_by_name(name)
            .await
            .map_err(|e| Error::array("find_host_by_name", name, e))
    }

    /// Id of the existing host for `connector`, never creating one
    pub async fn find_existing(&self, connector: &Connector) -> Result<Option<String>> {
        let classification = self.classifier.classify(connector).await?;
        Ok(self
            .extract_host(&classification, &connector.host)
            .await?
            .map(|h| h.id))
    }

    /// Id of the host for `connector`, creating the host and initiators as needed
    pub async fn resolve_or_create(&self, connector: &Connector) -> Result<String> {
        let classification = self.classifier.classify(connector).await?;

        let host = match self.extract_host(&classification, &connector.host).await? {
            Some(host) => host,
            None => {
                let host = self.gateway.create_host(&connector.host).await.map_err(|e| {
                    error!("Failed to create host {}: {}", connector.host, e);
                    Error::HostResolution {
                        host: connector.host.clone(),
                        reason: e.to_string(),
                    }
                })?;
                info!("Created host {} ({})", host.name, host.id);
                host
            }
        };

        if let Some(dummy) = &self.dummy_lun {
            if !host.has_luns() {
                self.occupy_hlu_zero(dummy, &host.id).await?;
            }
        }

        self.create_initiators(&classification.new_uids, &host.id)
            .await?;
        self.register_initiators(&classification.orphan, &host.id)
            .await?;

        debug!("Connector {} resolved to host {}", connector.host, host.id);
        Ok(host.id)
    }

    async fn create_initiators(&self, uids: &[String], host_id: &str) -> Result<()> {
        for uid in uids {
            match self.gateway.create_initiator(uid, host_id).await {
                Ok(initiator) => info!("Created initiator {} ({}) on {}", uid, initiator.id, host_id),
                Err(e) if e.is(ArrayErrorKind::AlreadyExists) => {
                    warn!("Initiator {} already exists", uid);
                }
                Err(e) => {
                    error!("Failed to create initiator {} on {}: {}", uid, host_id, e);
                    return Err(Error::array("create_initiator", uid, e));
                }
            }
        }
        Ok(())
    }

    async fn register_initiators(&self, orphans: &[Initiator], host_id: &str) -> Result<()> {
        for initiator in orphans {
            self.gateway
                .register_initiator(&initiator.id, host_id)
                .await
                .map_err(|e| {
                    error!(
                        "Failed to register initiator {} to {}: {}",
                        initiator.id, host_id, e
                    );
                    Error::array("register_initiator", &initiator.id, e)
                })?;
            info!("Registered initiator {} to {}", initiator.id, host_id);
        }
        Ok(())
    }

    /// Expose the placeholder LUN so real volumes never land on HLU 0
    async fn occupy_hlu_zero(&self, dummy: &DummyLunConfig, host_id: &str) -> Result<()> {
        let lun = self.dummy_lun(dummy).await?;
        self.exposure
            .expose_lun(&lun.id, host_id, AccessMask::Production)
            .await?;
        info!("Occupied HLU 0 of {} with {}", host_id, lun.id);
        Ok(())
    }

    async fn dummy_lun(&self, dummy: &DummyLunConfig) -> Result<Lun> {
        let spec = LunSpec {
            pool_id: dummy.pool_id.clone(),
            name: dummy.name.clone(),
            size_bytes: dummy.size_bytes,
        };
        match self.gateway.create_lun(&spec).await {
            Ok(lun) => Ok(lun),
            Err(e) if e.is(ArrayErrorKind::NameInUse) => {
                debug!("Reusing LUN {}", dummy.name);
                self.gateway
                    .find_lun_by_name(&dummy.name)
                    .await
                    .map_err(|e| Error::array("find_lun_by_name", &dummy.name, e))?
                    .ok_or_else(|| Error::ResourceNotFound {
                        kind: "lun".to_string(),
                        id: dummy.name.clone(),
                    })
            }
            Err(e) => {
                error!("Failed to create dummy LUN {}: {}", dummy.name, e);
                Err(Error::array("create_lun", &dummy.name, e))
            }
        }
    }
}
