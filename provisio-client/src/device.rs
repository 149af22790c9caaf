use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, instrument, trace};

use crate::auth::Authentication;
use crate::config::ProvisioningConfig;
use crate::error::ProvisioningError;
use crate::options::ProvisioningOption;
use crate::session::{Assignment, ProvisioningSession, RegistrationStatus, State};
use crate::transport::TransportProvider;

struct Shared {
    session: ProvisioningSession,
    stop: bool,
    do_work_period: Duration,
}

/// A provisioning session driven by a background worker.
///
/// The worker is started by the first successful `register` and calls
/// `do_work` on the session every `do_work_period` until the device is
/// dropped. All access to the session happens under a single lock, so
/// callbacks run on the worker thread with the lock held and must not call
/// back into the device.
pub struct ProvisioningDevice {
    shared: Arc<Mutex<Shared>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ProvisioningDevice {
    pub fn new<P>(
        config: ProvisioningConfig,
        auth: Box<dyn Authentication>,
        provider: &P,
    ) -> Result<Self, ProvisioningError>
    where
        P: TransportProvider + ?Sized,
    {
        let session = ProvisioningSession::new(config, auth, provider)?;
        Ok(Self::from_session(session))
    }

    /// Drive an existing session from a background worker
    pub fn from_session(session: ProvisioningSession) -> Self {
        let do_work_period = session.request.do_work_period;
        Self {
            shared: Arc::new(Mutex::new(Shared {
                session,
                stop: false,
                do_work_period,
            })),
            worker: Mutex::new(None),
        }
    }

    /// Start registering the device and the worker driving it.
    pub fn register<R, S>(&self, on_result: R, on_status: S) -> Result<(), ProvisioningError>
    where
        R: FnOnce(Result<Assignment, ProvisioningError>) + Send + 'static,
        S: FnMut(RegistrationStatus) + Send + 'static,
    {
        self.shared.lock().session.register(on_result, on_status)?;
        self.start_worker()
    }

    fn start_worker(&self) -> Result<(), ProvisioningError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        self.shared.lock().stop = false;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("provisioning".to_string())
            .spawn(move || schedule_work(shared))
            .map_err(|e| ProvisioningError::Error(format!("failed to start worker: {e}")))?;
        *worker = Some(handle);
        debug!("worker started");

        Ok(())
    }

    /// Set an option on the session.
    ///
    /// The worker period is handled here, everything else is passed on to
    /// the session.
    pub fn set_option(&self, option: ProvisioningOption) -> Result<(), ProvisioningError> {
        let mut shared = self.shared.lock();
        match option {
            ProvisioningOption::DoWorkFrequency(period) => {
                shared.do_work_period = period;
                Ok(())
            }
            option => shared.session.set_option(option),
        }
    }

    pub fn state(&self) -> State {
        self.shared.lock().session.state()
    }

    pub fn set_provisioning_payload(&self, json: &str) -> Result<(), ProvisioningError> {
        self.shared.lock().session.set_provisioning_payload(json)
    }

    pub fn provisioning_payload(&self) -> Option<String> {
        self.shared
            .lock()
            .session
            .provisioning_payload()
            .map(str::to_owned)
    }

    pub fn set_certificate_signing_request(&self, csr: &str) -> Result<(), ProvisioningError> {
        self.shared.lock().session.set_certificate_signing_request(csr)
    }

    pub fn issued_client_certificate(&self) -> Option<String> {
        self.shared
            .lock()
            .session
            .issued_client_certificate()
            .map(str::to_owned)
    }

    pub fn trust_bundle_json(&self) -> Option<String> {
        self.shared.lock().session.trust_bundle_json()
    }

    pub fn identity_trust_bundle(
        &self,
        cert_file: &str,
    ) -> Result<Option<String>, ProvisioningError> {
        self.shared.lock().session.identity_trust_bundle(cert_file)
    }
}

impl Drop for ProvisioningDevice {
    #[instrument(name = "stop_worker", skip_all)]
    fn drop(&mut self) {
        self.shared.lock().stop = true;
        if let Some(handle) = self.worker.get_mut().take() {
            if handle.join().is_err() {
                error!("worker panicked");
            }
            debug!("worker stopped");
        }
    }
}

fn schedule_work(shared: Arc<Mutex<Shared>>) {
    loop {
        let period = {
            let mut shared = shared.lock();
            if shared.stop {
                break;
            }
            shared.session.do_work();
            shared.do_work_period
        };
        thread::sleep(period);
    }
    trace!("worker exiting");
}
