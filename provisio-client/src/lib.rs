/*
Device side of a cloud provisioning service.

A device proves its identity (TPM endorsement key or X.509 certificate) to
the provisioning service, which assigns it to an IoT hub. Registration is a
request followed by status polls until the service reports an assignment,
while obeying the service constraints on request frequency.

The registration state machine lives in `ProvisioningSession` and is driven
by calling `do_work`. `ProvisioningDevice` wraps a session with a background
worker. The wire protocol and the key material are provided through the
`Transport` and `Authentication` traits.
*/

mod auth;
mod clock;
mod config;
mod device;
mod error;
mod options;
mod payload;
mod reply;
mod session;
mod transport;

pub use auth::{AuthError, AuthKind, Authentication};
pub use clock::{Clock, MonotonicClock};
pub use config::{API_VERSION, ProvisioningConfig, RequestConfig};
pub use device::ProvisioningDevice;
pub use error::ProvisioningError;
pub use options::{InvalidOptionError, ProvisioningOption};
pub use reply::{
    Assigned, CertificateMetadata, ParseError, ProvisioningStatus, TrustBundle,
    TrustBundleCertificate, parse as parse_reply,
};
pub use session::{
    Assignment, ProvisioningSession, RegisterCallback, RegistrationStatus, State, StatusCallback,
};
pub use transport::{
    OpenRequest, Protocol, ProxyOptions, Transport, TransportContext, TransportError,
    TransportEvent, TransportFailure, TransportProvider, TransportSettings, TransportStatus,
};
pub use util::types::{RegistrationId, ScopeId};

pub mod option_names {
    pub use crate::options::{
        DO_WORK_FREQUENCY_MS, HTTP_PROXY, LOG_TRACE, OPENSSL_ENGINE, OPENSSL_PRIVATE_KEY_TYPE,
        PROVISIONING_TIMEOUT, REGISTRATION_ID, TRUSTED_CERT,
    };
}

use provisio_util as util;

/// Version of this client library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
