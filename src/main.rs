use actix_web::{web, App, HttpServer};
use clinic_messaging_service::{
    config::{self, StorageBackend},
    db, error, logging,
    repository::{ConversationRepository, InMemoryRepository, PgConversationRepository},
    routes,
    services::JwtIdentityVerifier,
    state::{AppState, WsSettings},
};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let repo: Arc<dyn ConversationRepository> = match cfg.storage {
        StorageBackend::Postgres => {
            let pool = db::init_pool(&cfg)
                .await
                .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;
            db::MIGRATOR
                .run(&pool)
                .await
                .map_err(|e| error::AppError::StartServer(format!("migrations: {e}")))?;
            tracing::info!("database migrations applied");
            Arc::new(PgConversationRepository::new(pool))
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage; data is lost on restart");
            Arc::new(InMemoryRepository::new())
        }
    };

    let identity = Arc::new(JwtIdentityVerifier::from_config(&cfg)?);
    let (state, bridge_rx) = AppState::new(
        repo,
        identity,
        cfg.transaction_policies(),
        WsSettings::from(cfg.as_ref()),
    );

    // Single subscriber of the event bridge
    let _relay = state.dispatcher.clone().spawn_relay(bridge_rx);

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting clinic-messaging-service");

    HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind: {e}")))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(format!("server: {e}")))
}
