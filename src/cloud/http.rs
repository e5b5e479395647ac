//! HTTP cloud client.
//!
//! Buffers samples per session and uploads them as one JSON document on
//! [`CloudSession::sync`]. Buffered samples are kept when an upload fails so
//! a later sync can retry.

use super::{CloudCredentials, CloudError, CloudSession, CloudSync, SessionIdentity};
use crate::sensor::SensorKind;
use crate::transport::{Sample, SampleValue};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Cloud endpoint configuration.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Base URL, e.g. `https://cloud.example.org`
    pub endpoint: String,
    /// Request timeout
    pub timeout: Duration,
}

impl CloudConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Get the capture upload URL.
    pub fn upload_url(&self) -> String {
        format!("{}/v1/captures", self.endpoint.trim_end_matches('/'))
    }
}

/// HTTP-backed [`CloudSync`].
pub struct HttpCloud {
    config: CloudConfig,
    client: reqwest::Client,
}

impl HttpCloud {
    pub fn new(config: CloudConfig) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CloudError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }
}

impl CloudSync for HttpCloud {
    fn create_session(&self, identity: SessionIdentity) -> Arc<dyn CloudSession> {
        Arc::new(HttpCloudSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            identity,
            upload_url: self.config.upload_url(),
            client: self.client.clone(),
            buffer: Mutex::new(Vec::new()),
        })
    }
}

/// One buffered sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CloudSample {
    sensor: SensorKind,
    epoch_ms: i64,
    value: SampleValue,
}

/// Upload payload.
#[derive(Debug, Serialize)]
struct CapturePayload<'a> {
    session_id: &'a str,
    identity: &'a SessionIdentity,
    samples: &'a [CloudSample],
    sample_count: usize,
}

/// Session created by [`HttpCloud`].
pub struct HttpCloudSession {
    session_id: String,
    identity: SessionIdentity,
    upload_url: String,
    client: reqwest::Client,
    buffer: Mutex<Vec<CloudSample>>,
}

impl HttpCloudSession {
    /// Get the session ID.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn take_buffer(&self) -> Vec<CloudSample> {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn restore_buffer(&self, mut samples: Vec<CloudSample>) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        samples.append(&mut buffer);
        *buffer = samples;
    }
}

#[async_trait]
impl CloudSession for HttpCloudSession {
    fn record(&self, kind: SensorKind, sample: &Sample) -> Result<(), CloudError> {
        self.buffer
            .lock()
            .map_err(|_| CloudError::Rejected("session buffer poisoned".to_string()))?
            .push(CloudSample {
                sensor: kind,
                epoch_ms: sample.epoch_ms,
                value: sample.value,
            });
        Ok(())
    }

    fn pending(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn sync(&self, credentials: &CloudCredentials) -> Result<(), CloudError> {
        let samples = self.take_buffer();
        if samples.is_empty() {
            return Ok(());
        }

        let payload = CapturePayload {
            session_id: &self.session_id,
            identity: &self.identity,
            samples: &samples,
            sample_count: samples.len(),
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| CloudError::Serialization(e.to_string()));
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                self.restore_buffer(samples);
                return Err(e);
            }
        };

        let response = self
            .client
            .post(&self.upload_url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.restore_buffer(samples);
                return Err(CloudError::Network(e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            self.restore_buffer(samples);
            return Err(CloudError::Server {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_url() {
        let config = CloudConfig::new("https://cloud.example.org/");
        assert_eq!(config.upload_url(), "https://cloud.example.org/v1/captures");
    }

    #[test]
    fn test_session_buffers_samples() {
        let cloud = HttpCloud::new(CloudConfig::new("http://127.0.0.1:9")).unwrap();
        let session = cloud.create_session(SessionIdentity::new(
            "1.0.0",
            "AA:BB:CC:DD:EE:FF",
            "SimBoard",
            "Wrist",
        ));

        let sample = Sample::new(1_700_000_000_000, SampleValue::Scalar(101_325.0));
        session.record(SensorKind::Pressure, &sample).unwrap();
        session.record(SensorKind::Pressure, &sample).unwrap();
        assert_eq!(session.pending(), 2);
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_buffer() {
        let cloud = HttpCloud::new(CloudConfig::new("http://127.0.0.1:9")).unwrap();
        let session = cloud.create_session(SessionIdentity::new(
            "1.0.0",
            "AA:BB:CC:DD:EE:FF",
            "SimBoard",
            "Wrist",
        ));
        let sample = Sample::new(1_700_000_000_000, SampleValue::Scalar(1.0));
        session.record(SensorKind::Humidity, &sample).unwrap();

        let creds = CloudCredentials {
            username: "lab".to_string(),
            password: "secret".to_string(),
        };
        assert!(session.sync(&creds).await.is_err());
        assert_eq!(session.pending(), 1);
    }
}
