use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;

/// Identity a device registers under with the provisioning service
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationId(String);

impl Deref for RegistrationId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RegistrationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RegistrationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<RegistrationId> for String {
    fn from(value: RegistrationId) -> Self {
        value.0
    }
}
