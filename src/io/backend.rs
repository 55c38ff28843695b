//! Backend sink for engagement events
//!
//! One request per event; the backend only accepts or rejects.
//! Transport errors map to `NetworkUnavailable`, non-2xx to `Rejected`.

use crate::domain::engagement::EngagementPayload;
use crate::infra::config::Config;
use crate::infra::error::DeliveryError;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Header carrying the API key
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Destination of engagement deliveries
#[async_trait]
pub trait EngagementSink: Send + Sync {
    async fn deliver(&self, api_key: &str, payload: &EngagementPayload) -> Result<(), DeliveryError>;
}

/// HTTP sink posting JSON payloads to `{url}/engagements`
pub struct HttpSink {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder().timeout(config.backend_timeout()).build()?;
        let endpoint = format!("{}/engagements", config.backend_url().trim_end_matches('/'));
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl EngagementSink for HttpSink {
    async fn deliver(&self, api_key: &str, payload: &EngagementPayload) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::NetworkUnavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(event_id = %payload.event_id, status = %status.as_u16(), "backend_accepted");
            Ok(())
        } else {
            warn!(event_id = %payload.event_id, status = %status.as_u16(), "backend_rejected");
            Err(DeliveryError::Rejected { status: status.as_u16() })
        }
    }
}
