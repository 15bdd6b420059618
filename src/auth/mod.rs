mod claims;
mod credentials;

pub use claims::{inspect_token, Claims};
pub use credentials::{usable_token, CredentialProblem, CredentialStore, SharedCredentials};
