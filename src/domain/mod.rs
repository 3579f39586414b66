//! Domain layer - Attachment model and port definitions
//!
//! This module defines the array-agnostic model and the traits (ports) that
//! array gateways and zone lookup services implement.

pub mod model;
pub mod ports;

pub use model::*;
pub use ports::*;
