//! Broker worker: connects, provisions topology and consumes the four event
//! queues until ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use bunnyhop::broker::{MessageBroker, create_broker};
use bunnyhop::config::{Settings, load_config};
use bunnyhop::consumer::handler_fn;
use bunnyhop::utils::{HandlerError, logging};
use tracing::{error, info};

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&settings.log.level);

    if let Err(e) = run(settings).await {
        error!("Broker worker failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let broker = create_broker(&settings)?;
    for key in settings.topology.queues.keys() {
        let queue = key.clone();
        broker.register_event_handler(
            key,
            handler_fn(move |payload, correlation_id| {
                let queue = queue.clone();
                async move {
                    info!(queue = %queue, correlation_id = %correlation_id, payload = %payload, "Event received");
                    Ok::<(), HandlerError>(())
                }
            }),
        );
    }

    broker.connect().await?;
    broker.start_consuming().await?;
    info!(backend = ?settings.backend, "Broker worker started");

    let health = tokio::spawn(report_health(broker.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");

    health.abort();
    broker.close().await?;
    Ok(())
}

async fn report_health(broker: Arc<dyn MessageBroker>) {
    let mut interval = tokio::time::interval(HEALTH_INTERVAL);
    loop {
        interval.tick().await;
        match serde_json::to_string(&broker.health_status()) {
            Ok(status) => info!(status = %status, "Broker health"),
            Err(e) => error!(error = %e, "Failed to serialize health status"),
        }
    }
}
