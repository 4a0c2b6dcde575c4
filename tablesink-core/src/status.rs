use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};

use crate::Result;
use crate::message::{MonitorMessage, Status};

/// Publishes status notifications on the monitor route.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, message: &MonitorMessage) -> Result<()>;

    /// Drains anything buffered by [StatusPublisher::publish].
    async fn flush(&self) -> Result<()>;
}

/// Best-effort status reporting. Failures are logged and never surface to the caller, a message
/// outcome must not change because the monitor route is unavailable.
#[derive(Clone)]
pub struct StatusNotifier {
    publisher: Arc<dyn StatusPublisher>,
}

impl StatusNotifier {
    pub fn new(publisher: Arc<dyn StatusPublisher>) -> Self {
        Self { publisher }
    }

    /// Publishes and flushes one status for `route_id`. An empty route id has no route context,
    /// nothing is published.
    pub async fn notify(
        &self,
        route_id: &str,
        status: Status,
        exception: Option<String>,
        data: Option<Value>,
    ) {
        if route_id.is_empty() {
            debug!(?status, "No route context, skipping status notification");
            return;
        }

        debug!(route_id, ?status, "Sending monitor route status");
        let message = MonitorMessage::processor_state(route_id, status, exception, data);
        if let Err(e) = self.publisher.publish(&message).await {
            error!(route_id, ?status, ?e, "Unable to publish status to monitor route");
        }
        if let Err(e) = self.publisher.flush().await {
            error!(route_id, ?status, ?e, "Unable to flush monitor route");
        }
    }
}
