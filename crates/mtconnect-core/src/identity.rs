//! Persisted agent identity.
//!
//! The agent stamps its own metadata with a stable `uuid` and a
//! `changeToken` that is regenerated on every save. A missing or unreadable
//! identity file never stops the agent: a fresh identity is generated instead.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;
use uuid::Uuid;

/// Default identity file name.
pub const IDENTITY_FILENAME: &str = "agent.information.json";

/// Agent identity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    /// Token regenerated on every save
    pub change_token: String,
    /// Stable agent uuid
    pub uuid: String,
}

impl Default for AgentIdentity {
    fn default() -> Self {
        Self::generate()
    }
}

impl AgentIdentity {
    /// A fresh identity with random uuid and change token.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            change_token: Uuid::new_v4().to_string(),
            uuid: Uuid::new_v4().to_string(),
        }
    }

    /// Read an identity file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is empty, or is not a valid
    /// identity document.
    pub fn read(path: &Path) -> Result<Self, IdentityError> {
        let text = fs::read_to_string(path)?;
        if text.trim().is_empty() {
            return Err(IdentityError::Empty);
        }
        let identity: Self = serde_json::from_str(&text)?;
        if identity.uuid.trim().is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(identity)
    }

    /// Read an identity file, or generate a fresh identity if that fails.
    #[must_use]
    pub fn load_or_create(path: &Path) -> Self {
        match Self::read(path) {
            Ok(identity) => {
                tracing::debug!(path = %path.display(), uuid = %identity.uuid, "Loaded agent identity");
                identity
            }
            Err(IdentityError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No agent identity found, generating one");
                Self::generate()
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Unreadable agent identity, generating one");
                Self::generate()
            }
        }
    }

    /// Write the identity with a fresh change token.
    ///
    /// The file is written to a sibling temporary path and renamed into place.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or any file operation fails.
    pub fn save(&mut self, path: &Path) -> Result<(), IdentityError> {
        self.change_token = Uuid::new_v4().to_string();

        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Component id of the agent device: `agent_` plus 10 hex chars of the
    /// uuid hash.
    #[must_use]
    pub fn component_id(&self) -> String {
        let hex = format!("{:x}", Sha256::digest(self.uuid.as_bytes()));
        format!("agent_{}", &hex[..10])
    }
}

/// Errors reading or writing the identity file.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// File system error
    #[error("identity file I/O: {0}")]
    Io(#[from] io::Error),
    /// Malformed JSON
    #[error("identity file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// File present but empty
    #[error("identity file is empty")]
    Empty,
}
