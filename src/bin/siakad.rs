//! siakad CLI: queue workers, the admin surface, and manual queue operations.

use clap::{Parser, Subcommand};
use siakad_queue::admin::{self, AppState};
use siakad_queue::broker::{AmqpBroker, Broker};
use siakad_queue::config::Config;
use siakad_queue::engine::{ConsumerEngine, DeadLetterPolicy, EngineConfig};
use siakad_queue::jobs::{self, JobContext};
use siakad_queue::lock::LockManager;
use siakad_queue::notify;
use siakad_queue::store::{KvStore, RedisStore};
use siakad_queue::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "siakad", about = "Work-queue consumers and locks for the SIAKAD middleware")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume every registered queue until Ctrl-C
    Worker {
        /// Unacknowledged deliveries per queue
        #[arg(long, default_value_t = 1)]
        prefetch: u16,
        /// Simulated report generation time in milliseconds
        #[arg(long, default_value_t = 2000)]
        report_delay_ms: u64,
    },
    /// Run the admin HTTP surface on PORT
    Serve,
    /// Publish one JSON message
    Publish {
        /// Target queue
        queue: String,
        /// Message body as JSON
        message: String,
    },
    /// Drop every ready message in a queue
    Purge {
        /// Queue to purge
        queue: String,
    },
    /// Print depth and consumer count for every declared queue
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let _guard = telemetry(&config)?;

    match cli.command {
        Command::Worker {
            prefetch,
            report_delay_ms,
        } => cmd_worker(&config, prefetch, Duration::from_millis(report_delay_ms)).await,
        Command::Serve => cmd_serve(&config).await,
        Command::Publish { queue, message } => cmd_publish(&config, queue, message).await,
        Command::Purge { queue } => cmd_purge(&config, queue).await,
        Command::Stats => cmd_stats(&config).await,
    }
}

fn telemetry(config: &Config) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "siakad-queue".to_string(),
        log_level: config.log_level.clone(),
    })?)
}

async fn cmd_worker(config: &Config, prefetch: u16, report_delay: Duration) -> anyhow::Result<()> {
    let store = Arc::new(RedisStore::connect(&config.store).await?);
    let broker = Arc::new(AmqpBroker::connect(&config.broker).await?);
    let notifier = notify::from_config(&config.mail)?;

    let kv: Arc<dyn KvStore> = store.clone();
    let engine_config = EngineConfig {
        prefetch,
        dead_letter: config.max_delivery_attempts.map(DeadLetterPolicy::new),
    };
    let mut engine = ConsumerEngine::new(broker.clone(), engine_config).with_store(Arc::clone(&kv));
    jobs::register_all(
        &mut engine,
        JobContext {
            notifier,
            locks: LockManager::new(kv),
            student_domain: config.mail.student_domain.clone(),
            report_generation_time: report_delay,
        },
    );

    let ctrl = engine.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    let result = engine.run().await;

    broker.disconnect().await;
    store.disconnect().await;
    result?;
    Ok(())
}

async fn cmd_serve(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(RedisStore::connect(&config.store).await?);
    let broker = Arc::new(AmqpBroker::connect(&config.broker).await?);

    let state = AppState::new(broker.clone(), store.clone());
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
    };
    let result = admin::serve(state, config.port, shutdown).await;

    broker.disconnect().await;
    store.disconnect().await;
    result?;
    Ok(())
}

async fn cmd_publish(config: &Config, queue: String, message: String) -> anyhow::Result<()> {
    let message: serde_json::Value = serde_json::from_str(&message)?;
    let broker = AmqpBroker::connect(&config.broker).await?;

    let accepted = broker.publish(&queue, &message).await;
    broker.disconnect().await;

    if !accepted {
        anyhow::bail!("broker did not accept the message for {queue}");
    }
    println!("Published to {queue}");
    Ok(())
}

async fn cmd_purge(config: &Config, queue: String) -> anyhow::Result<()> {
    let broker = AmqpBroker::connect(&config.broker).await?;
    let purged = broker.purge(&queue).await;
    broker.disconnect().await;

    println!("Purged {} message(s) from {queue}", purged?);
    Ok(())
}

async fn cmd_stats(config: &Config) -> anyhow::Result<()> {
    let broker = AmqpBroker::connect(&config.broker).await?;

    println!("{:<28}  {:>8}  {:>9}", "QUEUE", "MESSAGES", "CONSUMERS");
    println!("{}", "-".repeat(49));
    for name in siakad_queue::registry::declared_names() {
        match broker.stats(name).await {
            Ok(stats) => println!(
                "{:<28}  {:>8}  {:>9}",
                stats.queue, stats.message_count, stats.consumer_count
            ),
            Err(e) => println!("{name:<28}  error: {e}"),
        }
    }

    broker.disconnect().await;
    Ok(())
}
