use thiserror::Error;

use crate::auth::AuthError;
use crate::options::InvalidOptionError;
use crate::reply::ParseError;
use crate::transport::TransportError;

/// Outcome of a failed provisioning operation
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Failed to parse service reply: {0}")]
    Parsing(#[source] ParseError),

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Device authentication failed: {0}")]
    DevAuth(String),

    #[error("Timed out waiting for the provisioning service")]
    Timeout,

    #[error("Failed to read the device key material: {0}")]
    KeyError(#[source] AuthError),

    #[error("The device enrollment is disabled")]
    Disabled,

    #[error("The service did not specify the assigned hub")]
    HubNotSpecified,

    #[error("The service refused the device credentials: {0}")]
    Unauthorized(#[source] ParseError),

    #[error("Registration failed: {0}")]
    Error(String),
}

impl From<ParseError> for ProvisioningError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::HubNotSpecified => ProvisioningError::HubNotSpecified,
            err if err.is_unauthorized() => ProvisioningError::Unauthorized(err),
            err @ ParseError::Failed { .. } => ProvisioningError::Error(err.to_string()),
            err => ProvisioningError::Parsing(err),
        }
    }
}

impl From<InvalidOptionError> for ProvisioningError {
    fn from(err: InvalidOptionError) -> Self {
        ProvisioningError::InvalidArg(err.to_string())
    }
}
