use thiserror::Error;

/// Errors raised by verifier operations.
///
/// Probe failures (refused connections, bad statuses, garbage bodies) are not
/// errors at this level; they are captured into a `ProbeResult`. Only calls
/// that cannot be carried out at all end up here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid \"protocols\" attribute: must specify some protocols to test")]
    InvalidProtocolList,

    #[error("Unable to reach the proxy check service: {0}")]
    UnreachableCheckService(String),

    #[error("Country data error: {0}")]
    Geo(String),
}

/// Result type alias for verifier operations
pub type Result<T> = std::result::Result<T, VerifyError>;
