mod registration_id;
mod scope_id;

pub use registration_id::RegistrationId;
pub use scope_id::{InvalidScopeIdError, ScopeId};
