use std::time::Duration;

use async_nats::Client;
use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use tablesink_core::handler::MessageHandler;
use tablesink_core::message::TransportMessage;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// A JetStream message, settled through the JetStream ack protocol.
pub struct JetStreamMessage {
    message: jetstream::Message,
}

impl From<jetstream::Message> for JetStreamMessage {
    fn from(message: jetstream::Message) -> Self {
        Self { message }
    }
}

#[async_trait]
impl TransportMessage for JetStreamMessage {
    fn payload(&self) -> &[u8] {
        &self.message.message.payload
    }

    async fn ack(&self) -> tablesink_core::Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| tablesink_core::Error::Transport(format!("ack failed: {e}")))
    }

    async fn nak_with_delay(&self, delay: Duration) -> tablesink_core::Result<()> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| tablesink_core::Error::Transport(format!("nak failed: {e}")))
    }
}

/// Durable pull consumer delivering route messages to the [MessageHandler], one task per message.
pub struct JetStreamSubscriber {
    consumer: PullConsumer,
    stream: String,
}

impl JetStreamSubscriber {
    /// Binds to an existing durable `consumer` on `stream`.
    pub async fn connect(client: Client, stream: &str, consumer: &str) -> Result<Self> {
        let js_ctx = jetstream::new(client);
        let consumer: PullConsumer = js_ctx
            .get_consumer_from_stream(consumer, stream)
            .await
            .map_err(|err| {
                Error::Jetstream(format!(
                    "Getting consumer {consumer} from stream {stream}: {err:?}"
                ))
            })?;
        Ok(Self {
            consumer,
            stream: stream.to_string(),
        })
    }

    /// Consumes until `cancel` fires, then waits for every in-flight message to be settled.
    /// Concurrency is bounded by the consumer's max ack pending.
    pub async fn run(self, handler: MessageHandler, cancel: CancellationToken) -> Result<()> {
        let mut messages = self
            .consumer
            .messages()
            .await
            .map_err(|e| Error::Jetstream(format!("Subscribing to stream {}: {e:?}", self.stream)))?;
        let in_flight = TaskTracker::new();
        info!(stream = %self.stream, "Consuming route messages");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Cancellation received, stopping consumer");
                    break;
                }
                next = messages.next() => {
                    let Some(next) = next else {
                        warn!(stream = %self.stream, "Message stream ended");
                        break;
                    };
                    let message = match next {
                        Ok(message) => JetStreamMessage::from(message),
                        Err(e) => {
                            warn!(?e, "Getting next message from the stream");
                            continue;
                        }
                    };
                    let handler = handler.clone();
                    in_flight.spawn(async move {
                        let outcome = handler.handle(&message).await;
                        debug!(?outcome, "Message settled");
                    });
                }
            }
        }

        in_flight.close();
        info!(pending = in_flight.len(), "Waiting for in-flight messages");
        in_flight.wait().await;
        Ok(())
    }
}
