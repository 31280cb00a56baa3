pub mod config;
pub mod github;

pub use github::{CredentialError, CredentialResolver, Generation};
