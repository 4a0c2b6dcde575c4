use async_nats::Client;
use async_trait::async_trait;
use bytes::Bytes;
use tablesink_core::message::MonitorMessage;
use tablesink_core::status::StatusPublisher;

use crate::Error;

/// Publishes monitor messages as JSON on a core NATS subject.
#[derive(Clone)]
pub struct NatsStatusPublisher {
    client: Client,
    subject: String,
}

impl NatsStatusPublisher {
    pub fn new(client: Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl StatusPublisher for NatsStatusPublisher {
    async fn publish(&self, message: &MonitorMessage) -> tablesink_core::Result<()> {
        let payload = Bytes::from(serde_json::to_vec(message)?);
        self.client
            .publish(self.subject.clone(), payload)
            .await
            .map_err(|e| Error::Nats(format!("publishing to {}: {e}", self.subject)))?;
        Ok(())
    }

    async fn flush(&self) -> tablesink_core::Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| Error::Nats(format!("flushing {}: {e}", self.subject)))?;
        Ok(())
    }
}
