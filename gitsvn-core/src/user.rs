//! Committer identity

use serde::{Deserialize, Serialize};

/// An authenticated user as handed over by the session layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    /// Login name
    pub username: String,
    /// Display name used for commit signatures
    pub real_name: String,
    /// Email used for commit signatures (may be empty)
    #[serde(default)]
    pub email: String,
}

impl User {
    pub fn new(username: impl Into<String>, real_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            real_name: real_name.into(),
            email: email.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("$anonymous", "anonymous", "")
    }

    pub fn is_anonymous(&self) -> bool {
        self.username == "$anonymous"
    }
}
