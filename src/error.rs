//! Error types for the SAN attach adapter
//!
//! Array-side failures arrive as [`ArrayError`] values whose vendor codes are
//! classified exactly once, at the gateway boundary, into [`ArrayErrorKind`].
//! Attachment components switch on that kind to decide between absorbing an
//! idempotent condition and raising one of the fatal [`Error`] variants.

use crate::domain::model::Protocol;
use thiserror::Error;

// =============================================================================
// Array Errors
// =============================================================================

/// Vendor error code: nothing to modify (LUN access or name unchanged)
pub const CODE_NOTHING_TO_MODIFY: i64 = 0x6701020;
/// Vendor error code: snapshot already attached
pub const CODE_SNAP_ALREADY_ATTACHED: i64 = 0x6000bdc;
/// Vendor error code: resource already exists
pub const CODE_RESOURCE_ALREADY_EXISTS: i64 = 108007952;
/// Vendor error code: LUN name already in use
pub const CODE_NAME_IN_USE: i64 = 108007744;
/// Vendor error code: resource does not exist
pub const CODE_RESOURCE_NOT_FOUND: i64 = 131149829;
/// Error code used when the request never produced an array response
pub const CODE_TRANSPORT: i64 = -1;

/// Closed classification of array error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayErrorKind {
    /// Object already exists (HTTP 409 or vendor "already exists")
    AlreadyExists,
    /// Modify request did not change anything
    NothingToModify,
    /// Snapshot is already attached to a host
    SnapAlreadyAttached,
    /// Requested name is taken by another object
    NameInUse,
    /// Object does not exist
    NotFound,
    /// Session rejected by the array
    Unauthorized,
    /// No response from the array
    Transport,
    /// Anything else
    Unknown,
}

impl ArrayErrorKind {
    /// Map a raw vendor error code and HTTP status to a kind
    pub fn classify(code: i64, http_status: Option<u16>) -> Self {
        match code {
            CODE_NOTHING_TO_MODIFY => return ArrayErrorKind::NothingToModify,
            CODE_SNAP_ALREADY_ATTACHED => return ArrayErrorKind::SnapAlreadyAttached,
            CODE_RESOURCE_ALREADY_EXISTS => return ArrayErrorKind::AlreadyExists,
            CODE_NAME_IN_USE => return ArrayErrorKind::NameInUse,
            CODE_RESOURCE_NOT_FOUND => return ArrayErrorKind::NotFound,
            _ => {}
        }

        match http_status {
            Some(409) => ArrayErrorKind::AlreadyExists,
            Some(404) => ArrayErrorKind::NotFound,
            Some(401) | Some(403) => ArrayErrorKind::Unauthorized,
            None if code == CODE_TRANSPORT => ArrayErrorKind::Transport,
            _ => ArrayErrorKind::Unknown,
        }
    }
}

impl std::fmt::Display for ArrayErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArrayErrorKind::AlreadyExists => "already_exists",
            ArrayErrorKind::NothingToModify => "nothing_to_modify",
            ArrayErrorKind::SnapAlreadyAttached => "snap_already_attached",
            ArrayErrorKind::NameInUse => "name_in_use",
            ArrayErrorKind::NotFound => "not_found",
            ArrayErrorKind::Unauthorized => "unauthorized",
            ArrayErrorKind::Transport => "transport",
            ArrayErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Error returned by every array gateway operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} (code {code}): {message}")]
pub struct ArrayError {
    pub kind: ArrayErrorKind,
    pub code: i64,
    pub http_status: Option<u16>,
    pub message: String,
}

impl ArrayError {
    /// Build an error from a raw array response
    pub fn from_response(code: i64, http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: ArrayErrorKind::classify(code, http_status),
            code,
            http_status,
            message: message.into(),
        }
    }

    /// Build an error of a known kind, picking a representative code
    pub fn of_kind(kind: ArrayErrorKind, message: impl Into<String>) -> Self {
        let (code, http_status) = match kind {
            ArrayErrorKind::AlreadyExists => (CODE_RESOURCE_ALREADY_EXISTS, Some(409)),
            ArrayErrorKind::NothingToModify => (CODE_NOTHING_TO_MODIFY, Some(400)),
            ArrayErrorKind::SnapAlreadyAttached => (CODE_SNAP_ALREADY_ATTACHED, Some(400)),
            ArrayErrorKind::NameInUse => (CODE_NAME_IN_USE, Some(409)),
            ArrayErrorKind::NotFound => (CODE_RESOURCE_NOT_FOUND, Some(404)),
            ArrayErrorKind::Unauthorized => (0, Some(401)),
            ArrayErrorKind::Transport => (CODE_TRANSPORT, None),
            ArrayErrorKind::Unknown => (0, Some(500)),
        };
        Self {
            kind,
            code,
            http_status,
            message: message.into(),
        }
    }

    pub fn is(&self, kind: ArrayErrorKind) -> bool {
        self.kind == kind
    }
}

// =============================================================================
// Adapter Errors
// =============================================================================

/// Unified error type for the adapter
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Attachment Errors
    // =========================================================================
    #[error("Host {host} has no {protocol} initiator")]
    MissingInitiator { host: String, protocol: Protocol },

    #[error("Failed to resolve host {host}: {reason}")]
    HostResolution { host: String, reason: String },

    #[error("Failed to {action} {resource} for host {host_id}: {source}")]
    Exposure {
        action: &'static str,
        resource: String,
        host_id: String,
        #[source]
        source: ArrayError,
    },

    #[error("Can not get the hlu information of host {host_id} for {resource}")]
    HluNotFound { host_id: String, resource: String },

    #[error("Connection information is unavailable because no target ports are available in the system")]
    NoTargetPorts,

    #[error("Connection information is unavailable because no FC initiator in host {host_id} has paths to the system")]
    NoAccessiblePaths { host_id: String },

    #[error("Zone lookup failed: {0}")]
    ZoneLookup(String),

    // =========================================================================
    // Array Errors
    // =========================================================================
    #[error("Array operation {operation} on {resource} failed: {source}")]
    ArrayOperation {
        operation: &'static str,
        resource: String,
        #[source]
        source: ArrayError,
    },

    #[error("Resource not found: {kind}/{id}")]
    ResourceNotFound { kind: String, id: String },

    // =========================================================================
    // API Errors
    // =========================================================================
    #[error("API request validation failed: {0}")]
    ApiValidation(String),

    // =========================================================================
    // Transport / Parse Errors
    // =========================================================================
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action the orchestrating platform should take on error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// The call may succeed if issued again later
    RetryLater,
    /// Surface to the user, retrying will not help
    Surface,
}

impl Error {
    /// Wrap a gateway failure with operation context
    pub fn array(operation: &'static str, resource: impl Into<String>, source: ArrayError) -> Self {
        Error::ArrayOperation {
            operation,
            resource: resource.into(),
            source,
        }
    }

    /// Wrap a failed lookup, reporting a missing object as `ResourceNotFound`
    pub fn lookup(operation: &'static str, kind: &str, id: &str, source: ArrayError) -> Self {
        if source.is(ArrayErrorKind::NotFound) {
            Error::ResourceNotFound {
                kind: kind.to_string(),
                id: id.to_string(),
            }
        } else {
            Error::array(operation, id, source)
        }
    }

    /// Determine what the caller should do with this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::ArrayOperation { source, .. } | Error::Exposure { source, .. }
                if matches!(
                    source.kind,
                    ArrayErrorKind::Transport | ArrayErrorKind::Unauthorized
                ) =>
            {
                ErrorAction::RetryLater
            }
            Error::Http(_) | Error::Io(_) => ErrorAction::RetryLater,

            Error::MissingInitiator { .. }
            | Error::Configuration(_)
            | Error::ApiValidation(_)
            | Error::YamlParse(_) => ErrorAction::Surface,

            _ => ErrorAction::Surface,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::RetryLater)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::ArrayOperation { source, .. } | Error::Exposure { source, .. } => {
                source.kind == ArrayErrorKind::Transport
            }
            _ => false,
        }
    }
}

/// Result type alias for the adapter
pub type Result<T> = std::result::Result<T, Error>;
