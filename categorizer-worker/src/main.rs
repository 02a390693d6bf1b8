//! Consume project events from RabbitMQ, categorize them and publish the result.
use std::time::Duration;

use categorizer_common::classifier::Classifier;
use categorizer_common::metrics::setup_metrics_recorder;
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use categorizer_worker::amqp::AmqpConnector;
use categorizer_worker::config::Config;
use categorizer_worker::error::WorkerError;
use categorizer_worker::server::{router, serve};
use categorizer_worker::worker::CategorizationWorker;

/// The worker reports at least once per heartbeat, allow a few missed ones.
const MISSED_HEARTBEATS: u32 = 3;

fn setup_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn shutdown_on_signal(shutdown: CancellationToken) -> Result<(), std::io::Error> {
    // Without signal handlers the process could not stop gracefully, so don't start.
    let handlers = signal::unix::signal(signal::unix::SignalKind::terminate()).and_then(|term| {
        Ok((term, signal::unix::signal(signal::unix::SignalKind::interrupt())?))
    });
    let (mut term, mut interrupt) = match handlers {
        Ok(handlers) => handlers,
        Err(e) => {
            shutdown.cancel();
            return Err(e);
        }
    };

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
        _ = shutdown.cancelled() => return Ok(()),
    };

    info!("shutting down gracefully...");
    shutdown.cancel();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();

    let config = Config::init_from_env()?;
    let shutdown = CancellationToken::new();

    let readiness = HealthRegistry::new("readiness");
    let worker_liveness = readiness
        .register(
            "worker".to_string(),
            config
                .heartbeat_interval
                .0
                .max(Duration::from_secs(1))
                * MISSED_HEARTBEATS,
        )
        .await;

    let classifier = Classifier::new(config.classifier())?;
    let connector = AmqpConnector::new(
        config.rabbitmq.uri(),
        config.rabbitmq.address(),
        "categorization-worker",
    );
    let mut worker = CategorizationWorker::new(
        connector,
        config.pipeline_settings(),
        classifier,
        worker_liveness,
    );

    let recorder_handle = setup_metrics_recorder()?;
    let app = router(readiness, Some(recorder_handle));
    let listener = TcpListener::bind(config.bind()).await?;
    info!("serving health checks on {}", config.bind());

    let signals = tokio::spawn(shutdown_on_signal(shutdown.clone()));
    let mut server = tokio::spawn(serve(app, listener, shutdown.clone()));
    let mut consumer = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.connect_and_run(shutdown).await }
    });

    // Whichever task ends first brings the other one down.
    tokio::select! {
        result = &mut server => {
            shutdown.cancel();
            consumer.await?;
            result??;
        }
        result = &mut consumer => {
            shutdown.cancel();
            result?;
            server.await??;
        }
    }

    signals.await??;

    Ok(())
}
