//! Authentication boundary
//!
//! The engine only needs "does this user/password pair log in, and into
//! which domain". Anything richer (tickets, login caches) plugs in behind
//! [`Authenticator`].

pub mod credentials;
pub mod validator;

pub use credentials::CredentialTable;
pub use validator::{Authenticator, StaticAuthenticator, UserProfile};
