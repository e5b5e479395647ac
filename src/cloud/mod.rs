//! Cloud sync adapter.
//!
//! A cloud session is created once per device before data starts flowing.
//! Captures forward every decoded sample to it; the buffered data is
//! uploaded with [`CloudSession::sync`] once the device is done. Failures
//! here are logged and never affect the local artifacts.

#[cfg(feature = "cloud")]
pub mod http;

use crate::sensor::SensorKind;
use crate::transport::Sample;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "cloud")]
pub use http::{CloudConfig, HttpCloud, HttpCloudSession};

/// Identity a cloud session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub firmware_revision: String,
    pub address: String,
    pub model: String,
    /// User-supplied capture name (the device name)
    pub capture_name: String,
    pub app_name: String,
    pub app_version: String,
}

impl SessionIdentity {
    pub fn new(
        firmware_revision: impl Into<String>,
        address: impl Into<String>,
        model: impl Into<String>,
        capture_name: impl Into<String>,
    ) -> Self {
        Self {
            firmware_revision: firmware_revision.into(),
            address: address.into(),
            model: model.into(),
            capture_name: capture_name.into(),
            app_name: "blelog".to_string(),
            app_version: crate::VERSION.to_string(),
        }
    }
}

/// Login for the cloud service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Cloud sync errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    #[error("cloud config error: {0}")]
    Config(String),

    #[error("cloud network error: {0}")]
    Network(String),

    #[error("cloud server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("cloud serialization error: {0}")]
    Serialization(String),

    #[error("cloud session rejected sample: {0}")]
    Rejected(String),
}

/// A per-device upload session.
#[async_trait]
pub trait CloudSession: Send + Sync {
    /// Buffer a decoded sample for upload.
    fn record(&self, kind: SensorKind, sample: &Sample) -> Result<(), CloudError>;

    /// Number of buffered samples not yet uploaded.
    fn pending(&self) -> usize;

    /// Upload everything buffered so far.
    async fn sync(&self, credentials: &CloudCredentials) -> Result<(), CloudError>;
}

/// Factory for cloud sessions.
pub trait CloudSync: Send + Sync {
    fn create_session(&self, identity: SessionIdentity) -> Arc<dyn CloudSession>;
}

/// Cloud service plus the login to sync with.
#[derive(Clone)]
pub struct CloudLink {
    pub service: Arc<dyn CloudSync>,
    pub credentials: CloudCredentials,
}

impl CloudLink {
    pub fn new(service: Arc<dyn CloudSync>, credentials: CloudCredentials) -> Self {
        Self {
            service,
            credentials,
        }
    }
}

/// Sync a session, logging the outcome. Never fails the caller.
pub(crate) async fn sync_session(
    address: &str,
    session: &dyn CloudSession,
    credentials: &CloudCredentials,
) {
    if session.pending() == 0 {
        tracing::debug!(mac = %address, "Nothing to sync");
        return;
    }
    tracing::info!(mac = %address, pending = session.pending(), "Syncing data to cloud");
    match session.sync(credentials).await {
        Ok(()) => tracing::info!(mac = %address, "Syncing completed"),
        Err(e) => tracing::warn!(mac = %address, error = %e, "Could not sync data to cloud"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = CloudCredentials {
            username: "lab".to_string(),
            password: "hunter2".to_string(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("lab"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_identity_carries_app_version() {
        let identity = SessionIdentity::new("1.4.0", "AA:BB:CC:DD:EE:FF", "MMS", "Wrist");
        assert_eq!(identity.app_version, crate::VERSION);
        assert_eq!(identity.capture_name, "Wrist");
    }
}
