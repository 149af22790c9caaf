use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::value::RawValue;

/*
    request {
        registrationId
        tpm? { endorsementKey, storageRootKey }
        clientCertificateCsr?
        payload?
    }
*/
// The service expects the keys in this exact order, do not reorder fields.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegistrationPayload<'a> {
    registration_id: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    tpm: Option<TpmAttestation>,

    #[serde(skip_serializing_if = "Option::is_none")]
    client_certificate_csr: Option<&'a str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a RawValue>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TpmAttestation {
    endorsement_key: String,
    storage_root_key: String,
}

impl<'a> RegistrationPayload<'a> {
    pub fn new(registration_id: &'a str) -> Self {
        Self {
            registration_id,
            tpm: None,
            client_certificate_csr: None,
            payload: None,
        }
    }

    pub fn with_tpm(mut self, endorsement_key: &[u8], storage_root_key: &[u8]) -> Self {
        self.tpm = Some(TpmAttestation {
            endorsement_key: BASE64.encode(endorsement_key),
            storage_root_key: BASE64.encode(storage_root_key),
        });
        self
    }

    pub fn with_csr(mut self, csr: Option<&'a str>) -> Self {
        self.client_certificate_csr = csr;
        self
    }

    pub fn with_payload(mut self, payload: Option<&'a RawValue>) -> Self {
        self.payload = payload;
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
