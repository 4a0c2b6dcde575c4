//! Entry point for one inbound message: decode, resolve the destination through the metadata
//! lookup, and buffer the records. The finalizer wraps the whole thing so every message ends in
//! exactly one ack or nak.

use std::sync::Arc;

use tracing::debug;

use crate::Result;
use crate::config::{FlushPolicy, TableProcessorConfig};
use crate::finalizer::{Finalizer, Outcome};
use crate::message::{RouteMessage, TransportMessage};
use crate::metadata::MetadataLookup;
use crate::registry::DestinationRegistry;
use crate::status::StatusNotifier;

/// Everything the pipeline shares across messages. Built once at startup and passed around
/// explicitly.
pub struct PipelineContext {
    pub registry: Arc<DestinationRegistry>,
    pub lookup: Arc<dyn MetadataLookup>,
    pub notifier: StatusNotifier,
}

#[derive(Clone)]
pub struct MessageHandler {
    context: Arc<PipelineContext>,
    finalizer: Finalizer,
}

impl MessageHandler {
    pub fn new(context: Arc<PipelineContext>, finalizer: Finalizer) -> Self {
        Self { context, finalizer }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.context
    }

    /// Handles and settles `message`.
    pub async fn handle(&self, message: &dyn TransportMessage) -> Outcome {
        let payload = message.payload();
        let decoded = RouteMessage::decode(payload);
        let route_id = match &decoded {
            Ok(route_message) => route_message.route_id.clone(),
            Err(_) => RouteMessage::recover_route_id(payload).unwrap_or_default(),
        };

        self.finalizer
            .run(message, &route_id, None, async move {
                self.process(decoded?).await
            })
            .await
    }

    async fn process(&self, route_message: RouteMessage) -> Result<()> {
        let route = self
            .context
            .lookup
            .find_route_by_id(&route_message.route_id)
            .await?;
        let processor = self
            .context
            .lookup
            .find_processor_by_id(&route.processor_id)
            .await?;

        let config = TableProcessorConfig::from_properties(processor.properties.as_ref())?;
        let policy = FlushPolicy::from(config);
        let buffer = self.context.registry.resolve(&processor.id, &policy);

        debug!(
            route_id = %route_message.route_id,
            destination = %processor.id,
            records = route_message.query_state.len(),
            "Buffering route records"
        );
        buffer
            .add(&route_message.route_id, route_message.query_state)
            .await
    }
}
