//! Registration state machine.
//!
//! A [`ProvisioningSession`] is single threaded and cooperative: nothing
//! happens unless the owner calls [`ProvisioningSession::do_work`]. Each call
//! pumps the transport, drains the events the transport queued while being
//! pumped and finally runs the timers (send, poll, deadline). Every input
//! goes through `handle_event`, which decides the next transition.
//!
//! ```text
//! Ready --register--> RegisterSent --authenticated/assigning--> Polling
//!                          |                                     |
//!                          +----------- assigned ----------------+--> Completed
//!                          +------------ failure ----------------+--> Error
//! ```

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::value::RawValue;
use tracing::{Span, debug, error, field, info, instrument, trace, warn};

use crate::auth::{AuthError, AuthKind, Authentication};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{API_VERSION, ProvisioningConfig, RequestConfig};
use crate::error::ProvisioningError;
use crate::options::ProvisioningOption;
use crate::payload::RegistrationPayload;
use crate::reply::{self, Assigned, ParseError, ProvisioningStatus, TrustBundle};
use crate::transport::{
    OpenRequest, Transport, TransportContext, TransportError, TransportEvent, TransportFailure,
    TransportProvider, TransportSettings, TransportStatus,
};
use crate::util::types::{RegistrationId, ScopeId};

// RFC 3986 unreserved characters and the sub-delimiters `!*'()` are left as is
const URL_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'!')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

// key name the service signs challenges with unless it names another one
const DEFAULT_KEY_NAME: &str = "registration";

pub type RegisterCallback = Box<dyn FnOnce(Result<Assignment, ProvisioningError>) + Send>;
pub type StatusCallback = Box<dyn FnMut(RegistrationStatus) + Send>;

/// Where the device was assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub iothub_uri: String,
    pub device_id: String,
}

/// Registration progress reported through the status callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Connected,
    Registering,
    Assigning,
    Assigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, registration not started
    Ready,
    /// Transport opened, waiting to send or for the service to accept
    RegisterSent,
    /// Waiting for the service to assign the device
    Polling,
    Completed,
    Error,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Completed | State::Error)
    }
}

#[derive(Debug)]
enum Event {
    Transport(TransportEvent),
    /// Run the timers
    Tick,
}

#[derive(Debug, PartialEq, Eq)]
enum Transition {
    Stay,
    To(State),
    Complete(Assignment),
}

#[derive(Debug, Default)]
struct Timing {
    started_at: Duration,
    last_send: Option<Duration>,
    next_poll: Duration,
    retry_after: Option<Duration>,
    poll_in_flight: bool,
}

pub struct ProvisioningSession {
    uri: String,
    scope_id: ScopeId,
    registration_id: Option<RegistrationId>,
    transport: Box<dyn Transport>,
    auth: Box<dyn Authentication>,
    auth_kind: AuthKind,
    clock: Box<dyn Clock>,
    pub(crate) request: RequestConfig,
    state: State,
    opened: bool,
    connected: bool,
    registration_sent: bool,
    custom_payload: Option<Box<RawValue>>,
    csr: Option<String>,
    last_operation_id: Option<String>,
    parsed_result: Option<ProvisioningStatus>,
    timing: Timing,
    events: VecDeque<TransportEvent>,
    on_result: Option<RegisterCallback>,
    on_status: Option<StatusCallback>,
}

impl ProvisioningSession {
    /// Create a session for the identity held by `auth`, using a transport
    /// created by `provider`.
    pub fn new<P>(
        config: ProvisioningConfig,
        auth: Box<dyn Authentication>,
        provider: &P,
    ) -> Result<Self, ProvisioningError>
    where
        P: TransportProvider + ?Sized,
    {
        if config.uri.is_empty() {
            return Err(ProvisioningError::InvalidArg(
                "provisioning uri must not be empty".to_string(),
            ));
        }

        let auth_kind = auth.kind();
        let transport = provider.create(TransportSettings {
            uri: config.uri.clone(),
            auth_kind,
            scope_id: config.scope_id.to_string(),
            api_version: API_VERSION,
        })?;

        debug!(
            uri = %config.uri,
            scope_id = %config.scope_id,
            protocol = %transport.protocol(),
            auth = ?auth_kind,
            "created provisioning session"
        );

        Ok(Self {
            uri: config.uri,
            scope_id: config.scope_id,
            registration_id: None,
            transport,
            auth,
            auth_kind,
            clock: Box::new(MonotonicClock::new()),
            request: config.request,
            state: State::Ready,
            opened: false,
            connected: false,
            registration_sent: false,
            custom_payload: None,
            csr: None,
            last_operation_id: None,
            parsed_result: None,
            timing: Timing::default(),
            events: VecDeque::new(),
            on_result: None,
            on_status: None,
        })
    }

    /// Use a different time source for the registration timers.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn uri(&self) -> &str {
        self.uri.as_str()
    }

    pub fn registration_id(&self) -> Option<&RegistrationId> {
        self.registration_id.as_ref()
    }

    /// Correlation id of the registration while the service processes it
    pub fn operation_id(&self) -> Option<&str> {
        self.last_operation_id.as_deref()
    }

    /// Start registering the device.
    ///
    /// This only opens the transport; the registration request goes out
    /// from [`ProvisioningSession::do_work`] once the transport reports it
    /// is connected. `on_result` is called exactly once with the outcome,
    /// `on_status` every time the registration makes progress. Both run on
    /// the thread calling `do_work`.
    #[instrument(skip_all, fields(registration_id = field::Empty), err)]
    pub fn register<R, S>(&mut self, on_result: R, on_status: S) -> Result<(), ProvisioningError>
    where
        R: FnOnce(Result<Assignment, ProvisioningError>) + Send + 'static,
        S: FnMut(RegistrationStatus) + Send + 'static,
    {
        if self.state != State::Ready {
            return Err(ProvisioningError::InvalidState(
                "registration has already been started",
            ));
        }

        // a registration id fetched here is only kept if the transport opens,
        // so a failed attempt asks the identity again next time
        let registration_id = match &self.registration_id {
            Some(registration_id) => registration_id.clone(),
            None => self
                .auth
                .registration_id()
                .map(RegistrationId::from)
                .map_err(|e| ProvisioningError::DevAuth(e.to_string()))?,
        };
        Span::current().record("registration_id", field::display(&registration_id));

        self.open_transport(&registration_id)?;

        self.registration_id = Some(registration_id);
        self.on_result = Some(Box::new(on_result));
        self.on_status = Some(Box::new(on_status));
        self.connected = false;
        self.registration_sent = false;
        self.timing = Timing {
            started_at: self.clock.now(),
            ..Timing::default()
        };
        self.state = State::RegisterSent;
        debug!("registration started");

        Ok(())
    }

    fn open_transport(
        &mut self,
        registration_id: &RegistrationId,
    ) -> Result<(), ProvisioningError> {
        let (endorsement_key, storage_root_key) = match self.auth_kind {
            AuthKind::Tpm => {
                let endorsement_key = self
                    .auth
                    .endorsement_key()
                    .map_err(ProvisioningError::KeyError)?;
                let storage_root_key = self
                    .auth
                    .storage_root_key()
                    .map_err(ProvisioningError::KeyError)?;
                (Some(endorsement_key), Some(storage_root_key))
            }
            AuthKind::X509 => {
                let certificate = self
                    .auth
                    .certificate()
                    .map_err(ProvisioningError::KeyError)?;
                let alias_key = self.auth.alias_key().map_err(ProvisioningError::KeyError)?;
                self.transport.set_x509_cert(&certificate, &alias_key)?;
                (None, None)
            }
        };

        self.transport.open(OpenRequest {
            registration_id: registration_id.as_str(),
            endorsement_key: endorsement_key.as_deref(),
            storage_root_key: storage_root_key.as_deref(),
        })?;
        self.opened = true;

        Ok(())
    }

    /// Pump the transport and advance the registration.
    ///
    /// Does nothing before `register` and once the registration has
    /// completed or failed.
    pub fn do_work(&mut self) {
        if !matches!(self.state, State::RegisterSent | State::Polling) {
            return;
        }

        let mut context = SessionContext {
            auth: self.auth.as_mut(),
            scope_id: &self.scope_id,
            registration_id: self.registration_id.as_ref(),
            sas_token_lifetime: self.request.sas_token_lifetime,
            events: &mut self.events,
        };
        self.transport.do_work(&mut context);

        while let Some(event) = self.events.pop_front() {
            self.step(Event::Transport(event));
            if self.state.is_terminal() {
                self.events.clear();
                return;
            }
        }

        self.step(Event::Tick);
    }

    fn step(&mut self, event: Event) {
        trace!(state = ?self.state, event = ?event, "handling event");
        match self.handle_event(event) {
            Ok(Transition::Stay) => {}
            Ok(Transition::To(state)) => {
                debug!(from = ?self.state, to = ?state, "state transition");
                self.state = state;
            }
            Ok(Transition::Complete(assignment)) => self.complete(assignment),
            Err(err) => self.fail(err),
        }
    }

    fn handle_event(&mut self, event: Event) -> Result<Transition, ProvisioningError> {
        match event {
            Event::Transport(TransportEvent::Status {
                status,
                retry_after,
            }) => Ok(self.on_transport_status(status, retry_after)),
            Event::Transport(TransportEvent::Reply(json)) => self.on_reply(&json),
            Event::Transport(TransportEvent::Failed(TransportFailure::Unauthorized)) => Err(
                ProvisioningError::DevAuth("the service rejected the device credentials".into()),
            ),
            Event::Transport(TransportEvent::Failed(TransportFailure::Error)) => {
                Err(ProvisioningError::Transport(TransportError::new(
                    "failure retrieving data from the provisioning service",
                )))
            }
            Event::Tick => self.on_tick(),
        }
    }

    fn on_transport_status(
        &mut self,
        status: TransportStatus,
        retry_after: Option<Duration>,
    ) -> Transition {
        if retry_after.is_some() {
            self.timing.retry_after = retry_after;
        }

        match status {
            TransportStatus::Connected => {
                self.connected = true;
                self.notify(RegistrationStatus::Connected);
                Transition::Stay
            }
            TransportStatus::Unassigned => {
                self.notify(RegistrationStatus::Registering);
                Transition::Stay
            }
            TransportStatus::Authenticated | TransportStatus::Assigning => {
                if status == TransportStatus::Assigning {
                    self.notify(RegistrationStatus::Assigning);
                }
                match self.state {
                    State::RegisterSent => self.start_polling(),
                    _ => {
                        self.poll_answered();
                        Transition::Stay
                    }
                }
            }
        }
    }

    fn on_reply(&mut self, json: &str) -> Result<Transition, ProvisioningError> {
        let polling = self.state == State::Polling;
        if polling {
            self.poll_answered();
        }

        let status = match reply::parse(json) {
            Ok(status) => status,
            Err(err) if polling && err.is_transient() => {
                warn!("ignoring unusable status reply: {err}");
                return Ok(Transition::Stay);
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(operation_id) = status.operation_id() {
            trace!(operation_id, "registration in progress");
            self.last_operation_id = Some(operation_id.to_owned());
        }

        let transition = match &status {
            ProvisioningStatus::Assigning { .. } => {
                self.notify(RegistrationStatus::Assigning);
                if polling {
                    Transition::Stay
                } else {
                    self.start_polling()
                }
            }
            ProvisioningStatus::Unassigned { .. } if polling => {
                return Err(ProvisioningError::Error(
                    "the service reverted the registration to unassigned".to_string(),
                ));
            }
            ProvisioningStatus::Unassigned {
                tpm_auth_key,
                key_name,
                ..
            } => {
                if let (AuthKind::Tpm, Some(nonce)) = (self.auth_kind, tpm_auth_key) {
                    self.answer_challenge(nonce, key_name.as_deref())?;
                }
                self.notify(RegistrationStatus::Registering);
                Transition::Stay
            }
            ProvisioningStatus::Assigned(assigned) => {
                self.import_hub_key(assigned)?;
                Transition::Complete(Assignment {
                    iothub_uri: assigned.iothub_uri.clone(),
                    device_id: assigned.device_id.clone(),
                })
            }
            ProvisioningStatus::Disabled => return Err(ProvisioningError::Disabled),
        };

        // replace the previous result only once it has been fully accepted
        self.parsed_result = Some(status);
        Ok(transition)
    }

    fn answer_challenge(
        &mut self,
        nonce: &[u8],
        key_name: Option<&str>,
    ) -> Result<(), ProvisioningError> {
        let Some(registration_id) = self.registration_id.as_ref() else {
            return Err(ProvisioningError::InvalidState("missing registration id"));
        };

        let token = challenge_token(
            self.auth.as_mut(),
            &self.scope_id,
            registration_id,
            self.request.sas_token_lifetime,
            nonce,
            key_name.unwrap_or(DEFAULT_KEY_NAME),
        )
        .map_err(|e| ProvisioningError::DevAuth(format!("failed to answer the challenge: {e}")))?;

        debug!("answering the service challenge");
        self.transport.answer_challenge(&token)?;
        Ok(())
    }

    fn import_hub_key(&mut self, assigned: &Assigned) -> Result<(), ProvisioningError> {
        if self.auth_kind != AuthKind::Tpm {
            return Ok(());
        }

        let key = assigned.authorization_key.as_deref().ok_or(ProvisioningError::Parsing(
            ParseError::MissingField {
                status: "assigned",
                field: "authenticationKey",
            },
        ))?;
        self.auth
            .import_key(key)
            .map_err(|e| ProvisioningError::DevAuth(format!("failed to import the hub key: {e}")))
    }

    fn on_tick(&mut self) -> Result<Transition, ProvisioningError> {
        let now = self.clock.now();
        if now.saturating_sub(self.timing.started_at) > self.request.timeout {
            return Err(ProvisioningError::Timeout);
        }

        match self.state {
            State::RegisterSent if self.connected && !self.registration_sent => {
                self.send_registration()?;
                self.registration_sent = true;
                self.timing.last_send = Some(now);
            }
            State::Polling if !self.timing.poll_in_flight && now >= self.timing.next_poll => {
                trace!(operation_id = ?self.last_operation_id, "requesting operation status");
                self.transport.get_operation_status()?;
                self.timing.poll_in_flight = true;
                self.timing.last_send = Some(now);
            }
            _ => {}
        }

        Ok(Transition::Stay)
    }

    fn send_registration(&mut self) -> Result<(), ProvisioningError> {
        let Some(registration_id) = self.registration_id.as_ref() else {
            return Err(ProvisioningError::InvalidState("missing registration id"));
        };

        let mut payload = RegistrationPayload::new(registration_id.as_str())
            .with_csr(self.csr.as_deref())
            .with_payload(self.custom_payload.as_deref());
        if self.auth_kind == AuthKind::Tpm {
            let endorsement_key = self
                .auth
                .endorsement_key()
                .map_err(ProvisioningError::KeyError)?;
            let storage_root_key = self
                .auth
                .storage_root_key()
                .map_err(ProvisioningError::KeyError)?;
            payload = payload.with_tpm(&endorsement_key, &storage_root_key);
        }
        let payload = payload.to_json().map_err(|e| {
            ProvisioningError::Error(format!("failed to encode the registration request: {e}"))
        })?;

        debug!("sending registration request");
        self.transport.register_device(&payload)?;
        Ok(())
    }

    fn start_polling(&mut self) -> Transition {
        self.timing.next_poll = self.clock.now().saturating_add(self.poll_interval());
        self.timing.poll_in_flight = false;
        Transition::To(State::Polling)
    }

    fn poll_answered(&mut self) {
        if self.timing.poll_in_flight {
            self.timing.poll_in_flight = false;
            self.timing.next_poll = self.clock.now().saturating_add(self.poll_interval());
        }
    }

    // the service may slow us down but never speed us up
    fn poll_interval(&self) -> Duration {
        self.timing
            .retry_after
            .map_or(self.request.poll_min_interval, |retry_after| {
                retry_after.max(self.request.poll_min_interval)
            })
    }

    fn notify(&mut self, status: RegistrationStatus) {
        if let Some(on_status) = self.on_status.as_mut() {
            on_status(status);
        }
    }

    fn complete(&mut self, assignment: Assignment) {
        info!(
            iothub_uri = %assignment.iothub_uri,
            device_id = %assignment.device_id,
            "device assigned"
        );
        self.notify(RegistrationStatus::Assigned);
        self.state = State::Completed;
        self.last_operation_id = None;
        self.close_transport();

        if let Some(on_result) = self.on_result.take() {
            on_result(Ok(assignment));
        }
        self.on_status = None;
    }

    fn fail(&mut self, err: ProvisioningError) {
        error!("registration failed: {err}");
        self.state = State::Error;
        self.last_operation_id = None;
        self.close_transport();

        if let Some(on_result) = self.on_result.take() {
            on_result(Err(err));
        }
        self.on_status = None;
    }

    fn close_transport(&mut self) {
        if !self.opened {
            return;
        }
        if let Err(e) = self.transport.close() {
            warn!("failed to close transport: {e}");
        }
        self.opened = false;
    }

    #[instrument(skip_all, fields(option = option.name()), err)]
    pub fn set_option(&mut self, option: ProvisioningOption) -> Result<(), ProvisioningError> {
        match option {
            ProvisioningOption::LogTrace(enabled) => self.transport.set_trace(enabled)?,
            ProvisioningOption::TrustedCerts(certificate) => {
                self.transport.set_trusted_cert(&certificate)?
            }
            ProvisioningOption::HttpProxy(proxy) => {
                if !proxy.is_valid() {
                    return Err(ProvisioningError::InvalidArg(format!(
                        "invalid proxy settings: {proxy:?}"
                    )));
                }
                self.transport.set_proxy(&proxy)?
            }
            ProvisioningOption::RegistrationId(registration_id) => {
                if self.state != State::Ready {
                    return Err(ProvisioningError::InvalidState(
                        "the registration id cannot change once registration has started",
                    ));
                }
                if registration_id.is_empty() {
                    return Err(ProvisioningError::InvalidArg(
                        "registration id must not be empty".to_string(),
                    ));
                }
                self.auth
                    .set_registration_id(&registration_id)
                    .map_err(|e| ProvisioningError::DevAuth(e.to_string()))?;
                self.registration_id = Some(registration_id.into());
            }
            ProvisioningOption::ProvisioningTimeout(secs) => {
                if secs == 0 {
                    return Err(ProvisioningError::InvalidArg(
                        "provisioning timeout must be positive".to_string(),
                    ));
                }
                self.request.timeout = Duration::from_secs(secs);
            }
            ProvisioningOption::DoWorkFrequency(_) => {
                debug!("ignoring worker option on a manually driven session");
            }
            ProvisioningOption::Passthrough { name, value } => {
                self.transport.set_option(&name, &value)?
            }
        }
        Ok(())
    }

    /// Set the custom JSON data sent along with the registration request,
    /// replacing any previous value.
    pub fn set_provisioning_payload(&mut self, json: &str) -> Result<(), ProvisioningError> {
        self.ensure_not_started()?;
        let payload = RawValue::from_string(json.to_owned()).map_err(|e| {
            ProvisioningError::InvalidArg(format!("provisioning payload is not valid JSON: {e}"))
        })?;
        self.custom_payload = Some(payload);
        Ok(())
    }

    /// Custom JSON data returned by the service with the assignment.
    pub fn provisioning_payload(&self) -> Option<&str> {
        self.assigned()
            .and_then(|assigned| assigned.custom_payload.as_deref())
    }

    /// Set the certificate signing request sent along with the registration
    /// request, replacing any previous value.
    pub fn set_certificate_signing_request(&mut self, csr: &str) -> Result<(), ProvisioningError> {
        self.ensure_not_started()?;
        if csr.is_empty() {
            return Err(ProvisioningError::InvalidArg(
                "certificate signing request must not be empty".to_string(),
            ));
        }
        self.csr = Some(csr.to_owned());
        Ok(())
    }

    /// Certificate issued by the service in answer to the signing request.
    pub fn issued_client_certificate(&self) -> Option<&str> {
        self.assigned()
            .and_then(|assigned| assigned.issued_client_certificate.as_deref())
    }

    pub fn trust_bundle(&self) -> Option<&TrustBundle> {
        self.assigned()
            .and_then(|assigned| assigned.trust_bundle.as_ref())
    }

    /// The trust bundle as a JSON document.
    pub fn trust_bundle_json(&self) -> Option<String> {
        self.trust_bundle()
            .and_then(|bundle| serde_json::to_string(bundle).ok())
    }

    /// Trust bundle the device identity itself provides for `cert_file`,
    /// independent of what the service returned.
    pub fn identity_trust_bundle(
        &self,
        cert_file: &str,
    ) -> Result<Option<String>, ProvisioningError> {
        self.auth
            .trust_bundle(cert_file)
            .map_err(ProvisioningError::KeyError)
    }

    fn assigned(&self) -> Option<&Assigned> {
        match &self.parsed_result {
            Some(ProvisioningStatus::Assigned(assigned)) => Some(assigned.as_ref()),
            _ => None,
        }
    }

    fn ensure_not_started(&self) -> Result<(), ProvisioningError> {
        if self.state != State::Ready {
            return Err(ProvisioningError::InvalidState(
                "registration data cannot change once registration has started",
            ));
        }
        Ok(())
    }
}

impl Drop for ProvisioningSession {
    fn drop(&mut self) {
        self.close_transport();
    }
}

/// Hooks handed to the transport while it is pumped
struct SessionContext<'a> {
    auth: &'a mut dyn Authentication,
    scope_id: &'a ScopeId,
    registration_id: Option<&'a RegistrationId>,
    sas_token_lifetime: Duration,
    events: &'a mut VecDeque<TransportEvent>,
}

impl TransportContext for SessionContext<'_> {
    fn emit(&mut self, event: TransportEvent) {
        self.events.push_back(event);
    }

    fn challenge(&mut self, nonce: &[u8], key_name: &str) -> Option<String> {
        let Some(registration_id) = self.registration_id else {
            error!("challenge received without a registration id");
            return None;
        };

        challenge_token(
            &mut *self.auth,
            self.scope_id,
            registration_id,
            self.sas_token_lifetime,
            nonce,
            key_name,
        )
        .inspect_err(|e| error!("failed to answer the challenge: {e}"))
        .ok()
    }
}

/// Import the service nonce and sign the registration scope with it
fn challenge_token(
    auth: &mut dyn Authentication,
    scope_id: &ScopeId,
    registration_id: &RegistrationId,
    lifetime: Duration,
    nonce: &[u8],
    key_name: &str,
) -> Result<String, AuthError> {
    if nonce.is_empty() {
        return Err(AuthError::new("challenge without a nonce"));
    }

    let scope = format!("{scope_id}/registrations/{registration_id}");
    let scope = utf8_percent_encode(&scope, URL_ENCODE_SET).to_string();

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AuthError::new(format!("system clock is before the epoch: {e}")))?;
    let expiry = now.saturating_add(lifetime).as_secs();

    auth.import_key(nonce)?;
    auth.construct_sas_token(&scope, key_name, expiry)
}
