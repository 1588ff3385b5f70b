use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use sink_task::config::Config;
use sink_task::kafka::KafkaLogClient;
use sink_task::serve::{install_recorder, router, serve};
use sink_task::sinks::LogSink;
use sink_task::time::SystemTime;
use sink_task::WorkerSinkTask;

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let recorder = install_recorder().context("Failed to install metrics recorder")?;
    let router = router(recorder);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Failed to serve metrics on {bind}: {e:#}");
        }
    }))
}

fn setup_tracing(json: bool) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    let log_layer = if json {
        base_layer.json().with_filter(filter()).boxed()
    } else {
        base_layer.with_filter(filter()).boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    setup_tracing(config.log_json);
    info!("Starting sink task");

    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let task_config = config.to_task_config().context("Invalid task configuration")?;
    let pipeline = config.to_pipeline().context("Invalid record pipeline configuration")?;
    let client = KafkaLogClient::new(&config.to_consumer_config(), config.kafka_max_poll_records)
        .context("Failed to create Kafka consumer. Check your Kafka connection settings.")?;

    let mut task = WorkerSinkTask::new(
        task_config,
        Arc::new(client),
        Box::new(LogSink::new()),
        pipeline,
        Arc::new(SystemTime::default()),
    );

    let handle = task.handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, stopping sink task");
                handle.stop();
            }
            Err(e) => warn!("Failed to listen for shutdown signal: {e:#}"),
        }
    });

    let result = task.run().await;

    match serde_json::to_string(&task.metrics()) {
        Ok(snapshot) => info!(task = task.id(), "Final task metrics: {snapshot}"),
        Err(e) => warn!("Failed to serialize task metrics: {e:#}"),
    }

    server_handle.abort();

    result.context("Sink task failed")?;
    Ok(())
}
