use std::env;
use std::error::Error;
use std::sync::Arc;

use tablesink_core::finalizer::Finalizer;
use tablesink_core::handler::{MessageHandler, PipelineContext};
use tablesink_core::metadata::{CachedLookup, MetadataLookup};
use tablesink_core::registry::DestinationRegistry;
use tablesink_core::status::StatusNotifier;
use tablesink_nats::{JetStreamSubscriber, NatsStatusPublisher};
use tablesink_postgres::{PgMetadataLookup, PgStorage, PoolConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::settings::Settings;

mod error;
mod settings;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = Settings::load(env::vars())?;
    info!(?settings, "Starting table sink");

    let pool = tablesink_postgres::connect(&PoolConfig::new(settings.dsn.as_str())).await?;
    let client = tablesink_nats::connect(&settings.nats).await?;

    let notifier = StatusNotifier::new(Arc::new(NatsStatusPublisher::new(
        client.clone(),
        settings.monitor_subject.as_str(),
    )));
    let lookup = Arc::new(CachedLookup::new(
        PgMetadataLookup::new(pool.clone()),
        settings.cache_ttl,
    ));
    let registry = Arc::new(DestinationRegistry::new(
        Arc::new(PgStorage::new(pool.clone())),
        notifier.clone(),
        settings.idle_timeout,
    ));
    let context = Arc::new(PipelineContext {
        registry: Arc::clone(&registry),
        lookup: Arc::clone(&lookup) as Arc<dyn MetadataLookup>,
        notifier: notifier.clone(),
    });
    let finalizer = if settings.retry_lookup_errors {
        Finalizer::new(tablesink_core::retry_lookup_is_terminal)
    } else {
        Finalizer::default()
    };
    let finalizer = finalizer
        .with_notifier(notifier)
        .panic_terminal(settings.panic_terminal)
        .notify_on_success(settings.notify_on_ack);
    let handler = MessageHandler::new(context, finalizer);

    let subscriber =
        JetStreamSubscriber::connect(client.clone(), &settings.stream, &settings.consumer).await?;

    let cln_token = CancellationToken::new();
    let sweeper = registry.start_idle_sweeper(settings.sweep_interval, cln_token.clone());

    let shutdown_cln_token = cln_token.clone();
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    // returns once cancelled and every in-flight message is settled, or when the stream ends
    let consumed = subscriber.run(handler, cln_token.clone()).await;
    if let Err(e) = &consumed {
        error!(?e, "Consumer failed");
    }

    // teardown, in order: stop accepting work, flush every destination, release connections
    cln_token.cancel();
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    if let Err(e) = sweeper.await {
        warn!(?e, "Idle sweeper did not exit cleanly");
    }
    registry.shutdown_all().await;
    lookup.purge().await;
    if let Err(e) = client.flush().await {
        warn!(?e, "Failed to flush NATS client");
    }
    pool.close().await;

    info!("Gracefully Exiting...");
    consumed?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
        info!("Received terminate signal");
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
