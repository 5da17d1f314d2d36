mod config;
mod db;
mod inference;
mod report;
mod routes;
mod storage;
#[cfg(test)]
mod test_utils;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use aws_sdk_s3::Client as S3Client;
use config::{AppConfig, PipelineConfig};
use db::dynamodb_repository::DynamoDbRepository;
use db::{PatientStore, ReportStore};
use inference::loader::TorchMaterializer;
use inference::{ModelCache, Predictor};
use report::{OpenAiReportGenerator, ReportGenerator};
use routes::configure_routes;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::s3_service::S3Service;
use storage::{BlobStore, ImageStore};

fn startup_error(context: &str, e: impl std::fmt::Display) -> io::Error {
    log::error!("{}: {}", context, e);
    io::Error::other(format!("{}: {}", context, e))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    }

    let app_config =
        AppConfig::from_env().map_err(|e| startup_error("Invalid configuration", e))?;
    let pipeline_config = PipelineConfig::load_or_default(Path::new(&app_config.pipeline_config))
        .map_err(|e| startup_error("Invalid pipeline config", e))?;

    let aws_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let dynamodb_client = DynamoDbClient::new(&aws_config);
    let s3_client = S3Client::new(&aws_config);

    let model_store: Arc<dyn BlobStore> = Arc::new(S3Service::new(
        s3_client.clone(),
        app_config.model_bucket.clone(),
    ));
    let image_store: Arc<dyn ImageStore> =
        Arc::new(S3Service::new(s3_client, app_config.image_bucket.clone()));

    let repository = Arc::new(DynamoDbRepository::new(
        dynamodb_client,
        app_config.patients_table.clone(),
        app_config.reports_table.clone(),
    ));
    let patients: Arc<dyn PatientStore> = repository.clone();
    let reports: Arc<dyn ReportStore> = repository;
    let mut openai = OpenAiReportGenerator::new(
        app_config.openai_api_key.clone(),
        app_config.openai_model.clone(),
    );
    if let Some(base_url) = &app_config.openai_base_url {
        openai = openai.with_base_url(base_url.clone());
    }
    let generator: Arc<dyn ReportGenerator> = Arc::new(openai);

    log::info!("Running inference on {:?}", app_config.device);
    let mut materializer = TorchMaterializer::new(app_config.device);
    if let Some(dir) = &app_config.model_scratch_dir {
        materializer = materializer.with_scratch_dir(PathBuf::from(dir));
    }
    let cache = Arc::new(ModelCache::new(
        model_store,
        Arc::new(materializer),
        pipeline_config.models.clone(),
    ));
    if app_config.preload_models {
        if let Err(e) = cache.preload().await {
            return Err(startup_error("Failed to preload models at startup", e));
        }
        log::info!("Models preloaded");
    }
    let predictor = web::Data::new(Predictor::new(cache, &pipeline_config));

    let patients = web::Data::from(patients);
    let reports = web::Data::from(reports);
    let images = web::Data::from(image_store);
    let generator = web::Data::from(generator);

    let bind_address = format!("0.0.0.0:{}", app_config.port);
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(predictor.clone())
            .app_data(patients.clone())
            .app_data(reports.clone())
            .app_data(images.clone())
            .app_data(generator.clone())
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
