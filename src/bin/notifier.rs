//! Consumes booking events from the notification queue.

use std::io;

use table_booking::config::RabbitConfig;
use table_booking::queue::{AmqpNotifier, LogHandler};

const PREFETCH: u16 = 16;

#[tokio::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let rabbitmq = RabbitConfig::from_env().map_err(io::Error::other)?;

    let notifier = AmqpNotifier::connect(&rabbitmq).await.map_err(io::Error::other)?;
    let channel = notifier.consume(LogHandler, PREFETCH).await.map_err(io::Error::other)?;

    tokio::signal::ctrl_c().await?;
    log::info!("ℹ️ Shutting down notification consumer");

    if let Err(e) = channel.close().await {
        log::warn!("Error closing consumer channel: {:?}", e);
    }
    notifier.close().await;

    Ok(())
}
