//! Credential storage
//!
//! In-memory credential table built from the `users` configuration section.

use std::collections::HashMap;

use crate::config::UserEntry;

/// Stored password and default domain for one user.
#[derive(Debug, Clone)]
pub(crate) struct Credential {
    pub password: String,
    pub domain: Option<String>,
}

/// User name -> credential lookup.
#[derive(Debug, Clone, Default)]
pub struct CredentialTable {
    entries: HashMap<String, Credential>,
}

impl CredentialTable {
    pub fn from_entries(users: &[UserEntry]) -> Self {
        let entries = users
            .iter()
            .map(|user| {
                (
                    user.name.clone(),
                    Credential {
                        password: user.password.clone(),
                        domain: user.domain.clone(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn insert(&mut self, name: &str, password: &str, domain: Option<&str>) {
        self.entries.insert(
            name.to_string(),
            Credential {
                password: password.to_string(),
                domain: domain.map(str::to_string),
            },
        );
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Credential> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
