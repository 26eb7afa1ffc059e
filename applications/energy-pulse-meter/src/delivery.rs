use crate::batch::MeasurementBatch;
use crate::config::InfluxConfig;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// The only status the ingestion endpoint returns for an accepted write.
pub const STATUS_NO_CONTENT: u16 = 204;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Nothing to send; no request was made.
    Skipped,
    Success,
    Failure,
}

/// Sends one request body to the ingestion endpoint and reports the status code.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, body: String) -> Result<u16>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    address: String,
}

impl HttpTransport {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            address: address.into(),
        })
    }

    pub fn from_config(config: &InfluxConfig) -> Result<Self> {
        Self::new(config.address.clone(), config.timeout())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, body: String) -> Result<u16> {
        let res = self.client.post(&self.address).body(body).send().await?;
        Ok(res.status().as_u16())
    }
}

pub struct DeliveryService<T: Transport> {
    transport: T,
}

impl<T: Transport> DeliveryService<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// One delivery cycle. The batch is cleared only on a 204 response;
    /// anything else leaves it for the next cycle.
    pub async fn attempt_delivery(&self, batch: &mut MeasurementBatch) -> DeliveryOutcome {
        let Some(snapshot) = batch.snapshot() else {
            return DeliveryOutcome::Skipped;
        };

        let records = batch.len();
        let outcome = match self.transport.send(snapshot.body().to_string()).await {
            Ok(status) => {
                debug!(status, records, "request sent");
                if status == STATUS_NO_CONTENT {
                    DeliveryOutcome::Success
                } else {
                    let err = AppError::UnexpectedStatus(status);
                    warn!(error = %err, records, "delivery rejected; keeping batch for retry");
                    DeliveryOutcome::Failure
                }
            }
            Err(e) => {
                warn!(error = %e, records, "delivery failed; keeping batch for retry");
                DeliveryOutcome::Failure
            }
        };

        batch.try_clear(&snapshot, outcome);
        outcome
    }
}
