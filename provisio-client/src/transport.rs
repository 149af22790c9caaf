//! Interface to the wire protocol used to reach the provisioning service.
//!
//! A [`Transport`] owns the connection and the protocol codec. It never
//! calls back into the session directly: while being pumped through
//! [`Transport::do_work`] it reports progress through a [`TransportContext`],
//! whose events the session drains once the pump returns.

use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

use crate::auth::AuthKind;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn reason(&self) -> &str {
        self.0.as_str()
    }
}

/// Wire protocol spoken by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Mqtt,
    MqttWs,
    Amqp,
    AmqpWs,
    Http,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Mqtt => "mqtt",
            Protocol::MqttWs => "mqtt-ws",
            Protocol::Amqp => "amqp",
            Protocol::AmqpWs => "amqp-ws",
            Protocol::Http => "http",
        };
        name.fmt(f)
    }
}

/// Progress reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// The connection to the service is up
    Connected,
    /// The registration request was accepted and can be polled
    Authenticated,
    /// The service has not started processing the registration
    Unassigned,
    /// The service is processing the registration
    Assigning,
}

/// Reason a transport gave up on a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// The service rejected the device credentials
    Unauthorized,
    /// Any other transport or protocol failure
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Status {
        status: TransportStatus,
        /// Delay the service asked for before the next status request
        retry_after: Option<Duration>,
    },
    /// JSON body of a reply to a registration or status request
    Reply(String),
    Failed(TransportFailure),
}

/// Hooks available to a transport while it is being pumped
pub trait TransportContext {
    /// Report an event to the registration state machine.
    fn emit(&mut self, event: TransportEvent);

    /// Answer a TPM nonce challenge, returning the SAS token to present to
    /// the service or `None` if one could not be built.
    fn challenge(&mut self, nonce: &[u8], key_name: &str) -> Option<String>;
}

/// Identity data handed to the transport when a session is opened
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest<'a> {
    pub registration_id: &'a str,
    pub endorsement_key: Option<&'a [u8]>,
    pub storage_root_key: Option<&'a [u8]>,
}

/// HTTP proxy used to reach the service
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Check the proxy has a host and that credentials come in pairs
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.username.is_some() == self.password.is_some()
    }
}

// keep the password out of the logs
impl std::fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

pub trait Transport: Send {
    fn protocol(&self) -> Protocol;

    /// Begin a session with the service.
    fn open(&mut self, request: OpenRequest<'_>) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    /// Send the registration request with the given JSON body.
    fn register_device(&mut self, payload: &str) -> Result<(), TransportError>;

    /// Ask the service for the status of the pending registration.
    fn get_operation_status(&mut self) -> Result<(), TransportError>;

    /// Authenticate the registration with the SAS token answering a TPM
    /// challenge carried by an `unassigned` reply.
    fn answer_challenge(&mut self, token: &str) -> Result<(), TransportError>;

    /// Pump the underlying I/O, reporting progress through `context`.
    fn do_work(&mut self, context: &mut dyn TransportContext);

    fn set_trace(&mut self, enabled: bool) -> Result<(), TransportError>;

    /// Install the client certificate and its private key.
    fn set_x509_cert(&mut self, certificate: &str, private_key: &str) -> Result<(), TransportError>;

    /// Install additional PEM encoded trusted root certificates.
    fn set_trusted_cert(&mut self, certificate: &str) -> Result<(), TransportError>;

    fn set_proxy(&mut self, proxy: &ProxyOptions) -> Result<(), TransportError>;

    /// Forward a protocol specific option.
    fn set_option(&mut self, name: &str, value: &str) -> Result<(), TransportError>;
}

/// Everything a transport needs to know at creation time
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub uri: String,
    pub auth_kind: AuthKind,
    pub scope_id: String,
    pub api_version: &'static str,
}

/// Creates transports for new sessions
pub trait TransportProvider {
    fn create(&self, settings: TransportSettings) -> Result<Box<dyn Transport>, TransportError>;
}

impl<F> TransportProvider for F
where
    F: Fn(TransportSettings) -> Result<Box<dyn Transport>, TransportError>,
{
    fn create(&self, settings: TransportSettings) -> Result<Box<dyn Transport>, TransportError> {
        self(settings)
    }
}
