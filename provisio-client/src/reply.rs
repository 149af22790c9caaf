//! Typed view of the provisioning service replies.
//!
//! Parsing is all-or-nothing: a reply either yields a complete
//! [`ProvisioningStatus`] owning every decoded value, or a [`ParseError`].
//! The only lenient part is the trust bundle, where unusable entries are
//! dropped individually.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{trace, warn};

use crate::util::json::deserialize_present;

const STATUS_UNASSIGNED: &str = "unassigned";
const STATUS_ASSIGNING: &str = "assigning";
const STATUS_ASSIGNED: &str = "assigned";
const STATUS_DISABLED: &str = "disabled";
// older services report disabled enrollments as blacklisted
const STATUS_BLACKLISTED: &str = "blacklisted";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed reply: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Reply with status '{status}' is missing '{field}'")]
    MissingField {
        status: &'static str,
        field: &'static str,
    },

    #[error("Reply with status '{status}' carries an invalid authentication key: {source}")]
    InvalidKey {
        status: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Assigned reply does not specify the assigned hub and device")]
    HubNotSpecified,

    #[error("Registration {status}: code {error_code:?}, {message:?}")]
    Failed {
        status: String,
        error_code: Option<i64>,
        message: Option<String>,
    },
}

impl ParseError {
    /// Whether the reply was only reporting progress, as opposed to carrying
    /// the final outcome of the registration.
    pub fn is_transient(&self) -> bool {
        match self {
            ParseError::MissingField { status, .. } | ParseError::InvalidKey { status, .. } => {
                *status == STATUS_ASSIGNING || *status == STATUS_UNASSIGNED
            }
            _ => false,
        }
    }

    /// Whether the service refused the device credentials (401xxx codes).
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ParseError::Failed { error_code: Some(code), .. } if code / 1000 == 401)
    }
}

/// Outcome reported by the service for a registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningStatus {
    Unassigned {
        operation_id: String,
        /// Nonce to prove possession of the TPM key with
        tpm_auth_key: Option<Vec<u8>>,
        key_name: Option<String>,
    },
    Assigning {
        operation_id: String,
    },
    Assigned(Box<Assigned>),
    Disabled,
}

impl ProvisioningStatus {
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            ProvisioningStatus::Unassigned { operation_id, .. }
            | ProvisioningStatus::Assigning { operation_id } => Some(operation_id.as_str()),
            _ => None,
        }
    }
}

/// Registration data returned once the device has been assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assigned {
    /// Key the device must import to talk to its hub (TPM identities)
    pub authorization_key: Option<Vec<u8>>,
    pub iothub_uri: String,
    pub device_id: String,
    pub issued_client_certificate: Option<String>,
    /// Operator supplied data, re-serialized as JSON
    pub custom_payload: Option<String>,
    pub trust_bundle: Option<TrustBundle>,
}

/// CA certificates the service instructs the device to trust.
///
/// Both fields are unset when the service explicitly reported no bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<Vec<TrustBundleCertificate>>,
}

impl TrustBundle {
    pub fn certificates(&self) -> &[TrustBundleCertificate] {
        self.certificates.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustBundleCertificate {
    /// PEM encoded certificate
    pub certificate: String,
    pub metadata: CertificateMetadata,
}

impl TrustBundleCertificate {
    pub fn is_self_signed(&self) -> bool {
        self.metadata.subject_name == self.metadata.issuer_name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateMetadata {
    pub subject_name: String,
    pub issuer_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1_thumbprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_thumbprint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before_utc: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after_utc: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/*
    reply {
        operationId?
        status
        registrationState? {
            registrationId?
            assignedHub?
            deviceId?
            tpm? { authenticationKey }
            issuedClientCertificate?
            payload?
            trustBundle? { etag, certificates: [{ certificate, metadata }] }
            errorCode?
            errorMessage?
        }
    }
*/
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReply {
    status: String,
    operation_id: Option<String>,
    key_name: Option<String>,
    registration_state: Option<RawRegistrationState>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRegistrationState {
    assigned_hub: Option<String>,
    device_id: Option<String>,
    tpm: Option<RawTpm>,
    issued_client_certificate: Option<String>,
    payload: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_present")]
    trust_bundle: Option<Option<Value>>,
    error_code: Option<i64>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTpm {
    authentication_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTrustBundle {
    etag: String,
    certificates: Vec<Value>,
}

/// Parse a raw service reply.
pub fn parse(raw: impl AsRef<[u8]>) -> Result<ProvisioningStatus, ParseError> {
    let reply: RawReply = serde_json::from_slice(raw.as_ref())?;
    trace!(status = %reply.status, "parsing reply");

    match reply.status.as_str() {
        STATUS_UNASSIGNED => {
            let operation_id = reply.operation_id.ok_or(ParseError::MissingField {
                status: STATUS_UNASSIGNED,
                field: "operationId",
            })?;
            let tpm_auth_key = reply
                .registration_state
                .and_then(|state| state.tpm)
                .map(|tpm| decode_key(STATUS_UNASSIGNED, tpm.authentication_key))
                .transpose()?;

            Ok(ProvisioningStatus::Unassigned {
                operation_id,
                tpm_auth_key,
                key_name: reply.key_name,
            })
        }

        STATUS_ASSIGNING => {
            let operation_id = reply.operation_id.ok_or(ParseError::MissingField {
                status: STATUS_ASSIGNING,
                field: "operationId",
            })?;
            Ok(ProvisioningStatus::Assigning { operation_id })
        }

        STATUS_ASSIGNED => {
            let state = reply
                .registration_state
                .ok_or(ParseError::HubNotSpecified)?;
            let (iothub_uri, device_id) = match (state.assigned_hub, state.device_id) {
                (Some(hub), Some(device)) => (hub, device),
                _ => return Err(ParseError::HubNotSpecified),
            };
            let authorization_key = state
                .tpm
                .map(|tpm| decode_key(STATUS_ASSIGNED, tpm.authentication_key))
                .transpose()?;
            let custom_payload = state
                .payload
                .filter(|payload| !payload.is_null())
                .map(|payload| serde_json::to_string(&payload))
                .transpose()?;
            let trust_bundle = state.trust_bundle.and_then(|bundle| match bundle {
                // explicitly null: the service has no bundle for this device
                None => Some(TrustBundle::default()),
                Some(value) => parse_trust_bundle(value),
            });

            Ok(ProvisioningStatus::Assigned(Box::new(Assigned {
                authorization_key,
                iothub_uri,
                device_id,
                issued_client_certificate: state.issued_client_certificate,
                custom_payload,
                trust_bundle,
            })))
        }

        STATUS_DISABLED | STATUS_BLACKLISTED => Ok(ProvisioningStatus::Disabled),

        _ => {
            let state = reply.registration_state.unwrap_or_default();
            Err(ParseError::Failed {
                status: reply.status,
                error_code: state.error_code,
                message: state.error_message,
            })
        }
    }
}

fn decode_key(status: &'static str, key: Option<String>) -> Result<Vec<u8>, ParseError> {
    let key = key.ok_or(ParseError::MissingField {
        status,
        field: "authenticationKey",
    })?;
    BASE64
        .decode(key)
        .map_err(|source| ParseError::InvalidKey { status, source })
}

fn parse_trust_bundle(value: Value) -> Option<TrustBundle> {
    let raw: RawTrustBundle = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("ignoring malformed trust bundle: {e}");
            return None;
        }
    };

    let certificates = raw
        .certificates
        .into_iter()
        .enumerate()
        .filter_map(|(idx, entry)| {
            serde_json::from_value::<TrustBundleCertificate>(entry)
                .inspect_err(|e| warn!("ignoring trust bundle certificate {idx}: {e}"))
                .ok()
        })
        .collect();

    Some(TrustBundle {
        etag: Some(raw.etag),
        certificates: Some(certificates),
    })
}
