//! Interface to the security module holding the device identity.
//!
//! The key material itself never leaves the implementation of
//! [`Authentication`]; the registration flow only asks for the public parts it
//! must present to the service and delegates every signing operation.

use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct AuthError(String);

impl AuthError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    pub fn reason(&self) -> &str {
        self.0.as_str()
    }
}

/// The kind of identity backing a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// Hardware symmetric key identity proven through a nonce challenge
    Tpm,
    /// Certificate identity proven by the TLS handshake
    X509,
}

pub trait Authentication: Send {
    fn kind(&self) -> AuthKind;

    /// Registration id derived from the identity.
    fn registration_id(&self) -> Result<String, AuthError>;

    /// Override the registration id derived from the identity.
    fn set_registration_id(&mut self, registration_id: &str) -> Result<(), AuthError>;

    /// TPM endorsement key (TPM identities only).
    fn endorsement_key(&self) -> Result<Vec<u8>, AuthError>;

    /// TPM storage root key (TPM identities only).
    fn storage_root_key(&self) -> Result<Vec<u8>, AuthError>;

    /// PEM encoded device certificate (X.509 identities only).
    fn certificate(&self) -> Result<String, AuthError>;

    /// PEM encoded private key matching [`Authentication::certificate`].
    fn alias_key(&self) -> Result<String, AuthError>;

    /// Import a key handed over by the service into the security module.
    fn import_key(&mut self, key: &[u8]) -> Result<(), AuthError>;

    /// Build a SAS token for `scope` signed with the imported key.
    ///
    /// `expiry` is expressed in seconds since the UNIX epoch.
    fn construct_sas_token(
        &mut self,
        scope: &str,
        key_name: &str,
        expiry: u64,
    ) -> Result<String, AuthError>;

    /// Read the trust bundle the security module keeps in `cert_file`, if
    /// the module manages one.
    fn trust_bundle(&self, _cert_file: &str) -> Result<Option<String>, AuthError> {
        Ok(None)
    }
}
