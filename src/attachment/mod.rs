//! Host Attachment Engine
//!
//! Components of the attach/detach flow:
//! - Classifier: sorts a connector's initiators by registration state
//! - Host resolver: finds or creates the array host
//! - Exposure: grants and revokes host access
//! - Connection: builds protocol connection parameters
//! - Orchestrator: runs the flow with rollback

pub mod classifier;
pub mod connection;
pub mod exposure;
pub mod host;
pub mod locks;
pub mod orchestrator;

pub use classifier::{connector_uids, Classification, InitiatorClassifier};
pub use connection::{build_init_targ_map, ConnectionInfoBuilder, ResourceLocation, TargetSelector};
pub use exposure::{ExposureManager, ExposureReceipt};
pub use host::HostResolver;
pub use locks::{HostLockGuard, HostLocks};
pub use orchestrator::{AttachmentOrchestrator, OrchestratorConfig};
