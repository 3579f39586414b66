//! Array Gateways
//!
//! Implementations of [`ArrayGateway`](crate::domain::ports::ArrayGateway):
//! - Unity REST: the array management API over HTTPS
//! - In-memory: a simulated array for standalone mode and tests

pub mod memory;
pub mod unity;

pub use memory::{ArrayCall, InMemoryArray, MappingBehavior};
pub use unity::{Session, UnityConfig, UnityRestGateway};

use crate::config::AdapterConfig;
use crate::domain::model::{Protocol, StorageProcessor, TargetPort};
use crate::domain::ports::ArrayGatewayRef;
use crate::error::Result;
use std::sync::Arc;
use tracing::info;

/// Factory for creating array gateways
pub struct GatewayFactory;

impl GatewayFactory {
    /// Gateway talking to the configured array
    pub fn create(config: &AdapterConfig) -> Result<ArrayGatewayRef> {
        Ok(Arc::new(UnityRestGateway::new(config.array.clone())?))
    }

    /// Simulated array with two ports per storage processor for `protocol`
    pub fn standalone(protocol: Protocol) -> Arc<InMemoryArray> {
        const PORTS: [(StorageProcessor, u8, &str, &str); 4] = [
            (StorageProcessor::A, 0, "192.168.10.10", "5006016036e00e5a"),
            (StorageProcessor::A, 1, "192.168.10.11", "5006016136e00e5a"),
            (StorageProcessor::B, 0, "192.168.11.10", "5006016836e00e5a"),
            (StorageProcessor::B, 1, "192.168.11.11", "5006016936e00e5a"),
        ];

        let array = InMemoryArray::new();
        for (sp, idx, ip, port_wwn) in PORTS {
            let port = match protocol {
                Protocol::Iscsi => TargetPort::iscsi(
                    &format!("sp{}_eth{}", sp, idx + 2),
                    sp,
                    &format!("iqn.1992-04.com.emc:cx.standalone.{}{}", sp, idx),
                    ip,
                ),
                Protocol::Fc => TargetPort::fc(
                    &format!("sp{}_iom_0_fc{}", sp, idx),
                    sp,
                    "50060160b6e00e5a",
                    port_wwn,
                ),
            };
            array.add_port(port);
        }
        info!("Standalone array simulated with {} {} ports", PORTS.len(), protocol);
        Arc::new(array)
    }
}
