mod admin;
mod config;
mod db;
mod handlers;
mod tls;
mod verifier;

use tracing::info;

use actix_web::{
    App,
    HttpResponse,
    HttpServer,
    middleware::Logger
};

use std::sync::Arc;

use actix_web::web::{self};

use config::ServerConfig;
use db::{DbPool, SqliteStore};
use examguard::IntegrityServices;
use handlers::Services;
use verifier::GatewaySignatureVerifier;

const LOG_FILTER: &str = "info,actix_server=warn,actix_http::h1::dispatcher=off";

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let message = err.to_string();
        actix_web::error::InternalError::from_response(
            err,
            HttpResponse::BadRequest().json(serde_json::json!({ "error": message })),
        )
        .into()
    })
}

pub fn configure_routes() -> impl actix_web::dev::HttpServiceFactory {
    web::scope("")
        .service(
            web::scope("/api")
                .app_data(json_config())
                .service(
                    web::scope("/exams/{exam_id}")
                        .route("/incidents", web::post().to(handlers::report_incident))
                        .route("/suspension", web::get().to(handlers::suspension_status))
                        .route("/start", web::post().to(handlers::start_exam))
                        .route("/submit", web::post().to(handlers::submit_exam))
                        .route("/attempts", web::get().to(handlers::attempts))
                )
                .service(
                    web::scope("/payments")
                        .route("/order", web::post().to(handlers::create_order))
                        .route("/verify", web::post().to(handlers::verify_payment))
                        .route("/webhook", web::post().to(handlers::payment_webhook))
                )
                .service(
                    web::scope("/admin")
                        .route("/incidents", web::get().to(admin::list_incidents))
                        .route("/suspensions", web::get().to(admin::list_suspensions))
                        .route("/suspensions/{id}/remove", web::post().to(admin::remove_suspension))
                        .route("/suspensions/{id}/keep", web::post().to(admin::keep_suspension))
                )
        )
}

/// Wire the integrity services over the shared database.
pub fn build_services(
    config: &ServerConfig,
    db: DbPool,
) -> (web::Data<Services>, web::Data<GatewaySignatureVerifier>) {
    let store = Arc::new(SqliteStore::new(db));
    let verifier = Arc::new(GatewaySignatureVerifier::new(
        config.payment_key_secret.as_deref(),
        config.payment_webhook_secret.as_deref(),
    ));
    let services = IntegrityServices::new(store, verifier.clone(), config.lock_timeout, config.lock_poll);
    (web::Data::new(services), web::Data::from(verifier))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let mut _guard = None;

    if ServerConfig::file_logging_enabled() {
        let file_appender = tracing_appender::rolling::RollingFileAppender::new(
            tracing_appender::rolling::Rotation::DAILY,
            "./logs",
            "examguard-server.log"
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::writer::MakeWriterExt::and(non_blocking, std::io::stdout))
            .with_file(true)
            .with_line_number(true)
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| LOG_FILTER.into()))
            .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new("%Y-%m-%dT%H:%M:%S".to_string()))
            .init();

        _guard = Some(guard);
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stdout)
            .with_file(true)
            .with_line_number(true)
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| LOG_FILTER.into()))
            .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new("%Y-%m-%dT%H:%M:%S".to_string()))
            .init();
    }

    let config = ServerConfig::from_env();

    let db_pool = db::init::init_db(&config.database_url)
        .expect("Failed to initialize database");

    db::init::run_migrations(&db_pool)
        .expect("Failed to run database migrations");

    db::init::seed_settings(&db_pool)
        .expect("Failed to seed global settings");

    info!("Database {} initialized", config.database_url);

    let (services, verifier) = build_services(&config, db_pool);
    let bind = (config.bind_addr.clone(), config.port);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(services.clone())
            .app_data(verifier.clone())
            .wrap(Logger::default())
            .service(configure_routes())
    });

    if config.use_tls {
        info!("Server starting with TLS on https://{}:{}/", bind.0, bind.1);

        let tls_config = tls::init_rustls_config(&config.tls_cert, &config.tls_key)
            .map_err(|e| std::io::Error::other(format!("TLS setup failed: {}", e)))?;

        server.bind_rustls_0_23(bind, tls_config)?.run().await
    } else {
        info!("Server starting on http://{}:{}/", bind.0, bind.1);

        server.bind(bind)?.run().await
    }
}
