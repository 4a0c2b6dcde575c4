use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;
use crate::error::Error;

/// One row to persist, column name to scalar value in insertion order.
pub type Record = Map<String, Value>;

const MONITOR_PROCESSOR_STATE: &str = "monitor_processor_state";

/// Inbound message carrying the records produced on a route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(default)]
    pub route_id: String,
    #[serde(default)]
    pub query_state: Vec<Record>,
}

impl RouteMessage {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::Decode(format!("failed to decode route message: {e}")))
    }

    /// Best effort extraction of the route id from a payload that did not decode as a
    /// [RouteMessage], so the failure can still be reported against the route.
    pub fn recover_route_id(payload: &[u8]) -> Option<String> {
        let value: Value = serde_json::from_slice(payload).ok()?;
        value
            .get("route_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Completed,
    Failed,
}

/// Status notification published on the monitor route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorMessage {
    #[serde(rename = "type")]
    pub typ: String,
    pub route_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl MonitorMessage {
    pub fn processor_state(
        route_id: impl Into<String>,
        status: Status,
        exception: Option<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            typ: MONITOR_PROCESSOR_STATE.to_string(),
            route_id: route_id.into(),
            status,
            exception,
            data,
        }
    }
}

/// A message delivered by the transport. Exactly one of [TransportMessage::ack] or
/// [TransportMessage::nak_with_delay] must be called per message.
#[async_trait]
pub trait TransportMessage: Send + Sync {
    fn payload(&self) -> &[u8];

    /// Consumes the message, it will not be redelivered.
    async fn ack(&self) -> Result<()>;

    /// Asks the transport to redeliver the message after `delay`.
    async fn nak_with_delay(&self, delay: Duration) -> Result<()>;
}
