use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::util::json::{deserialize_duration_from_ms, serialize_duration_to_ms};
use crate::util::types::ScopeId;

/// Service API version requested by the client
pub const API_VERSION: &str = "2021-06-01";

/// Provisioning service endpoint configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProvisioningConfig {
    /// Global device endpoint, e.g. `global.azure-devices-provisioning.net`
    pub uri: String,

    pub scope_id: ScopeId,

    #[serde(default)]
    pub request: RequestConfig,
}

impl ProvisioningConfig {
    pub fn new(uri: impl Into<String>, scope_id: ScopeId) -> Self {
        Self {
            uri: uri.into(),
            scope_id,
            request: RequestConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RequestConfig {
    /// Deadline for the whole registration, counted from the register call
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub timeout: Duration,

    /// Minimum time between two operation status requests
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub poll_min_interval: Duration,

    /// Validity of the SAS tokens built to answer TPM challenges
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub sas_token_lifetime: Duration,

    /// Time the background worker sleeps between two pumps
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub do_work_period: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_min_interval: Duration::from_secs(2),
            sas_token_lifetime: Duration::from_secs(3600),
            do_work_period: Duration::from_millis(1),
        }
    }
}
