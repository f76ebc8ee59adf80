mod auth;
mod db;
mod inference;
mod routes;
mod storage;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use auth::jwt::JwtService;
use auth::middleware::AuthMiddleware;
use db::repository::SqliteRepository;
use inference::classifier::Classifier;
use inference::predictor::Predictor;
use routes::configure_routes;
use std::env;
use storage::media_store::MediaStore;

/// Deployment knobs that handlers need beyond their injected services.
#[derive(Clone)]
pub struct AppConfig {
    pub admin_emails: Vec<String>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    dotenv::dotenv().ok();

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    }

    // The model loads once per process; a bad artifact must fail startup, not
    // the first request.
    let model_path =
        env::var("MODEL_PATH").unwrap_or_else(|_| "models/plant_disease_v1.0.0.onnx".to_string());
    let model_sha256 = env::var("MODEL_SHA256").ok();
    let classifier = match Classifier::load(&model_path, model_sha256.as_deref()) {
        Ok(classifier) => classifier,
        Err(e) => {
            log::error!("Failed to preload model at startup: {e}");
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Model loading failed: {e}"),
            ));
        }
    };
    let predictor = web::Data::new(Predictor::new(classifier));

    let database_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:detections.db".to_string());
    let pool = match db::schema::connect(&database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            log::error!("Failed to open database {database_url}: {e}");
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Database init failed: {e}"),
            ));
        }
    };
    if let Err(e) = db::schema::init_schema(&pool).await {
        log::error!("Failed to initialize database schema: {e}");
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Schema init failed: {e}"),
        ));
    }
    let db_repo = SqliteRepository::new(pool);

    let media_root = env::var("MEDIA_ROOT").unwrap_or_else(|_| "media".to_string());
    let media_store = MediaStore::new(media_root);

    let jwt_secret = env::var("JWT_SECRET").unwrap();
    let jwt_service = JwtService::new(&jwt_secret);
    let auth_middleware = AuthMiddleware::new(jwt_service.clone());

    let admin_emails: Vec<String> = env::var("ADMIN_EMAILS")
        .unwrap_or_default()
        .split(',')
        .map(|email| email.trim().to_string())
        .filter(|email| !email.is_empty())
        .collect();
    if admin_emails.is_empty() {
        log::warn!("ADMIN_EMAILS is empty; /api/admin endpoints will be unreachable");
    }
    let config = AppConfig { admin_emails };

    let port = env::var("PORT").unwrap_or_else(|_| "8081".to_string());
    let bind_address = format!("0.0.0.0:{}", port);

    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(auth_middleware.clone())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::AUTHORIZATION,
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(predictor.clone())
            .app_data(web::Data::new(db_repo.clone()))
            .app_data(web::Data::new(media_store.clone()))
            .app_data(web::Data::new(jwt_service.clone()))
            .app_data(web::Data::new(config.clone()))
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
