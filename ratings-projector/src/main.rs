//! Project `RatingSubmittedEvent`s from Kafka into the `product_stats` view.
use std::sync::Arc;

use envconfig::Envconfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ratings_common::consumer::RatingStreamConsumer;
use ratings_common::health::HealthRegistry;
use ratings_common::kafka::create_kafka_producer;
use ratings_common::metrics::{probe_router, serve};
use ratings_common::store::PgStatsStore;
use ratings_projector::config::Config;
use ratings_projector::dead_letter::KafkaDeadLetterSink;
use ratings_projector::worker::{run_dispatcher, run_worker, Projector};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_probe_server(bind: String, liveness: HealthRegistry) -> JoinHandle<()> {
    let router = probe_router("rating events projector", liveness);

    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_tracing();
    info!("starting rating events projector");

    let config = Config::init_from_env().expect("invalid configuration:");

    let liveness = HealthRegistry::new("liveness");

    let store = PgStatsStore::connect(&config.database_url, config.max_pg_connections).await?;

    let consumer = RatingStreamConsumer::new(&config.kafka, &config.consumer)?;
    info!(
        "subscribed to topic: {}",
        config.consumer.kafka_consumer_topic
    );

    let producer_liveness = liveness
        .register("rdkafka".to_string(), time::Duration::seconds(30))
        .await;
    let producer = create_kafka_producer(&config.kafka, producer_liveness).await?;
    let dead_letter = Arc::new(KafkaDeadLetterSink::new(
        producer,
        config.dead_letter_topic.clone(),
    ));

    start_probe_server(config.bind(), liveness.clone());

    let projector = Arc::new(Projector::new(
        store,
        dead_letter,
        config.retry_policy(),
    ));

    let worker_count = config.worker_count();
    let mut lanes = Vec::with_capacity(worker_count);
    let mut workers = Vec::with_capacity(worker_count);
    for i in 0..worker_count {
        let (tx, rx) = mpsc::channel(config.worker_channel_size);
        lanes.push(tx);

        let worker_liveness = liveness
            .register(format!("worker-{}", i), time::Duration::seconds(60))
            .await;
        workers.push(tokio::spawn(run_worker(
            rx,
            projector.clone(),
            worker_liveness,
        )));
    }

    let dispatcher_liveness = liveness
        .register("dispatcher".to_string(), time::Duration::seconds(60))
        .await;
    let dispatcher = tokio::spawn(run_dispatcher(consumer, lanes, dispatcher_liveness));

    // The dispatcher only returns when a lane is gone; treat any exit as fatal
    // and let the orchestrator restart us from the last stored offsets.
    dispatcher.await?;
    for worker in workers {
        worker.await?;
    }

    Ok(())
}
