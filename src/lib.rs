//! SAN Attach Adapter - Host Attachment Orchestration
//!
//! Attaches and detaches array volumes and snapshots to compute hosts over
//! iSCSI or Fibre Channel, returning the connection parameters a host needs
//! to log in to the targets.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              REST API (axum)                                 │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                        Attachment Orchestrator                               │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │   Initiator     │  │      Host       │  │        Exposure             │  │
//! │  │   Classifier    │─▶│    Resolver     │─▶│        Manager              │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────┬───────────────┘  │
//! │                                                          │                   │
//! │                    ┌───────────────────────┐  ┌──────────┴──────────────┐   │
//! │                    │   Per-host Locks      │  │  Connection Info        │   │
//! │                    │                       │  │  Builder                │   │
//! │                    └───────────────────────┘  └─────────────────────────┘   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                               Ports                                          │
//! │  ┌─────────────────────────────────────┐  ┌─────────────────────────────┐   │
//! │  │          ArrayGateway               │  │        ZoneLookup           │   │
//! │  │   (Unity REST / in-memory)          │  │     (static fabrics)        │   │
//! │  └─────────────────────────────────────┘  └─────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`attachment`]: Attach/detach flow and its components
//! - [`api`]: REST surface
//! - [`gateway`]: Array management API clients
//! - [`zoning`]: Fabric zone lookup
//! - [`config`]: Configuration file model
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod api;
pub mod attachment;
pub mod config;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod zoning;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use attachment::{AttachmentOrchestrator, OrchestratorConfig};

pub use config::{AdapterConfig, DummyLunConfig, HostLockMode, ZoningConfig};

pub use domain::model::{
    ConnectionInfo, Connector, Protocol, SnapshotRef, StorageProcessor, TerminateInfo, VolumeRef,
};
pub use domain::ports::{ArrayGateway, ArrayGatewayRef, ZoneLookup, ZoneLookupRef};

pub use error::{ArrayError, ArrayErrorKind, Error, ErrorAction, Result};

pub use gateway::{GatewayFactory, InMemoryArray, UnityConfig, UnityRestGateway};

pub use zoning::StaticZoneLookup;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
