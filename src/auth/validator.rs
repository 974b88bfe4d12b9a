//! Authentication validator
//!
//! Defines the [`Authenticator`] seam used by the `PASS` handler and a
//! table-backed implementation.

use async_trait::async_trait;
use log::{info, warn};

use super::credentials::CredentialTable;
use crate::error::AuthError;

const MAX_INPUT_LENGTH: usize = 256;

/// Who logged in and where they land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub name: String,
    pub domain: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, user: &str, password: &str) -> Result<UserProfile, AuthError>;
}

/// Performs basic input sanitation to check for malicious or malformed usernames/passwords.
fn is_valid_input(input: &str) -> bool {
    !input.trim().is_empty() && input.len() <= MAX_INPUT_LENGTH && !input.contains(['\r', '\n', '\0'])
}

/// Authenticates against a fixed [`CredentialTable`].
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    table: CredentialTable,
}

impl StaticAuthenticator {
    pub fn new(table: CredentialTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, user: &str, password: &str) -> Result<UserProfile, AuthError> {
        if !is_valid_input(user) {
            return Err(AuthError::InvalidUsername(user.to_string()));
        }
        if !is_valid_input(password) {
            return Err(AuthError::InvalidCredentials);
        }

        match self.table.get(user) {
            Some(credential) if credential.password == password => {
                info!("User {} authenticated", user);
                Ok(UserProfile {
                    name: user.to_string(),
                    domain: credential.domain.clone(),
                })
            }
            Some(_) => {
                warn!("Wrong password for user {}", user);
                Err(AuthError::InvalidCredentials)
            }
            None => {
                warn!("Unknown user {}", user);
                Err(AuthError::InvalidCredentials)
            }
        }
    }
}
