//! Initiator Classifier
//!
//! Splits the initiators named by a connector into those already bound to
//! a host, those known to the array but unbound, and those the array has
//! never seen. Read-only.

use crate::domain::model::{Connector, Initiator, Protocol};
use crate::domain::ports::ArrayGatewayRef;
use crate::error::{Error, Result};
use tracing::debug;

/// Result of classifying a connector's initiators
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub registered: Vec<Initiator>,
    pub orphan: Vec<Initiator>,
    pub new_uids: Vec<String>,
}

impl Classification {
    /// Host bound to the first registered initiator
    pub fn registered_host(&self) -> Option<&str> {
        self.registered.first().and_then(|i| i.host_id.as_deref())
    }
}

/// Initiator UIDs carried by `connector` for `protocol`
///
/// FC UIDs are node and port WWN concatenated, upper-cased, without colons.
pub fn connector_uids(connector: &Connector, protocol: Protocol) -> Result<Vec<String>> {
    let missing = || Error::MissingInitiator {
        host: connector.host.clone(),
        protocol,
    };

    match protocol {
        Protocol::Iscsi => match connector.initiator.as_deref() {
            Some(iqn) if !iqn.is_empty() => Ok(vec![iqn.to_string()]),
            _ => Err(missing()),
        },
        Protocol::Fc => {
            let (wwnns, wwpns) = match (&connector.wwnns, &connector.wwpns) {
                (Some(n), Some(p)) if !n.is_empty() && !p.is_empty() => (n, p),
                _ => return Err(missing()),
            };
            Ok(wwnns
                .iter()
                .zip(wwpns.iter())
                .map(|(node, port)| format!("{}{}", node, port).replace(':', "").to_uppercase())
                .collect())
        }
    }
}

pub struct InitiatorClassifier {
    gateway: ArrayGatewayRef,
    protocol: Protocol,
}

impl InitiatorClassifier {
    pub fn new(gateway: ArrayGatewayRef, protocol: Protocol) -> Self {
        Self { gateway, protocol }
    }

    pub async fn classify(&self, connector: &Connector) -> Result<Classification> {
        let mut result = Classification::default();

        for uid in connector_uids(connector, self.protocol)? {
            let found = self
                .gateway
                .find_initiator(&uid)
                .await
                .map_err(|e| Error::array("find_initiator", &uid, e))?;
            match found {
                Some(initiator) if initiator.is_registered() => result.registered.push(initiator),
                Some(initiator) => result.orphan.push(initiator),
                None => result.new_uids.push(uid),
            }
        }

        debug!(
            "Initiators of {}: {} registered, {} orphan, {} new",
            connector.host,
            result.registered.len(),
            result.orphan.len(),
            result.new_uids.len()
        );
        Ok(result)
    }
}
