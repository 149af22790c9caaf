use std::time::Duration;

use thiserror::Error;

use crate::transport::ProxyOptions;

pub const LOG_TRACE: &str = "logtrace";
pub const TRUSTED_CERT: &str = "TrustedCerts";
pub const REGISTRATION_ID: &str = "registration_id";
pub const PROVISIONING_TIMEOUT: &str = "provisioning_timeout";
pub const HTTP_PROXY: &str = "http_proxy";
pub const DO_WORK_FREQUENCY_MS: &str = "do_work_freq_ms";
pub const OPENSSL_ENGINE: &str = "Engine";
pub const OPENSSL_PRIVATE_KEY_TYPE: &str = "x509PrivatekeyType";

#[derive(Debug, Error)]
#[error("Invalid value '{value}' for option '{name}'")]
pub struct InvalidOptionError {
    name: String,
    value: String,
}

/// Runtime settings accepted by a provisioning session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOption {
    /// Trace the wire traffic of the transport
    LogTrace(bool),
    /// Additional PEM encoded trusted root certificates
    TrustedCerts(String),
    /// Registration id to use instead of the one derived from the identity
    RegistrationId(String),
    /// Registration deadline in seconds
    ProvisioningTimeout(u64),
    HttpProxy(ProxyOptions),
    /// Pump cadence of the background worker
    DoWorkFrequency(Duration),
    /// Protocol specific setting forwarded to the transport verbatim
    Passthrough { name: String, value: String },
}

impl ProvisioningOption {
    pub fn name(&self) -> &str {
        match self {
            ProvisioningOption::LogTrace(_) => LOG_TRACE,
            ProvisioningOption::TrustedCerts(_) => TRUSTED_CERT,
            ProvisioningOption::RegistrationId(_) => REGISTRATION_ID,
            ProvisioningOption::ProvisioningTimeout(_) => PROVISIONING_TIMEOUT,
            ProvisioningOption::HttpProxy(_) => HTTP_PROXY,
            ProvisioningOption::DoWorkFrequency(_) => DO_WORK_FREQUENCY_MS,
            ProvisioningOption::Passthrough { name, .. } => name.as_str(),
        }
    }

    /// Build an option from its name and a string value.
    ///
    /// Proxies are given as `host:port`. Names that are not recognized are
    /// treated as transport options (e.g. the OpenSSL engine settings).
    pub fn from_name(name: &str, value: &str) -> Result<Self, InvalidOptionError> {
        let invalid = || InvalidOptionError {
            name: name.to_owned(),
            value: value.to_owned(),
        };

        let option = match name {
            LOG_TRACE => ProvisioningOption::LogTrace(value.parse().map_err(|_| invalid())?),
            TRUSTED_CERT => ProvisioningOption::TrustedCerts(value.to_owned()),
            REGISTRATION_ID => ProvisioningOption::RegistrationId(value.to_owned()),
            PROVISIONING_TIMEOUT => {
                ProvisioningOption::ProvisioningTimeout(value.parse().map_err(|_| invalid())?)
            }
            HTTP_PROXY => {
                let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
                let port = port.parse().map_err(|_| invalid())?;
                ProvisioningOption::HttpProxy(ProxyOptions::new(host, port))
            }
            DO_WORK_FREQUENCY_MS => {
                let ms: u64 = value.parse().map_err(|_| invalid())?;
                ProvisioningOption::DoWorkFrequency(Duration::from_millis(ms))
            }
            _ => ProvisioningOption::Passthrough {
                name: name.to_owned(),
                value: value.to_owned(),
            },
        };
        Ok(option)
    }
}
