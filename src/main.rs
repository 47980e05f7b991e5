use actix_web::{middleware, web, App, HttpServer};
use std::io;

use table_booking::auth::{AdminDirectory, JwtKeys};
use table_booking::config::Config;
use table_booking::gate::RedisGate;
use table_booking::handlers::{self, AppState};
use table_booking::ledger::{initialize_db_pool, PgLedger};
use table_booking::queue::AmqpNotifier;
use table_booking::saga::{BookingService, SagaPolicy};

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env().map_err(io::Error::other)?;

    // initialize DB pool outside of `HttpServer::new` so that it is shared across all workers
    let pool = initialize_db_pool(
        &config.postgres.url,
        config.postgres.max_connections,
        config.postgres.connect_timeout,
    )
    .map_err(io::Error::other)?;

    let gate = RedisGate::connect(&config.redis.url).await.map_err(io::Error::other)?;
    let notifier = AmqpNotifier::connect(&config.rabbitmq).await.map_err(io::Error::other)?;

    let state = web::Data::new(AppState {
        service: BookingService::new(
            gate,
            PgLedger::new(pool),
            notifier,
            SagaPolicy {
                min_lead_time: config.booking.min_lead_time,
                notify_attempts: config.booking.notify_attempts,
            },
        ),
        admins: AdminDirectory::new(config.auth.admin_ids.iter().copied()),
        request_timeout: config.booking.request_timeout,
    });
    let keys = web::Data::new(JwtKeys::new(&config.auth.jwt_secret));

    log::info!("🚀 Starting HTTP server at http://{}:{}", config.http.host, config.http.port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .app_data(keys.clone())
            .wrap(middleware::Logger::default())
            .configure(handlers::configure::<RedisGate, PgLedger, AmqpNotifier>)
    })
    .bind((config.http.host.as_str(), config.http.port))?
    .run()
    .await
}
