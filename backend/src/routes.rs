use actix_multipart::Multipart;
use actix_web::{Error, HttpResponse, web};
use futures::{StreamExt, TryStreamExt};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Write;
use uuid::Uuid;

use crate::auth;
use crate::auth::middleware::AuthenticatedUser;
use crate::db::models::DetectionRecord;
use crate::db::repository::SqliteRepository;
use crate::inference::predictor::{PredictionError, Predictor};
use crate::inference::preprocess::PreprocessError;
use crate::storage::media_store::MediaStore;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct FlagRequest {
    reason: String,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/api/auth/register").route(web::post().to(auth::routes::register)))
        .service(web::resource("/api/auth/login").route(web::post().to(auth::routes::login)))
        .service(
            web::resource("/api/auth/profile")
                .route(web::get().to(auth::routes::profile))
                .route(web::put().to(auth::routes::update_profile)),
        )
        .service(
            web::resource("/api/auth/change-password")
                .route(web::post().to(auth::routes::change_password)),
        )
        .service(
            web::resource("/api/auth/delete-account")
                .route(web::delete().to(auth::routes::delete_account)),
        )
        .service(web::resource("/api/predict").route(web::post().to(handle_predict)))
        .service(
            web::resource("/api/history")
                .route(web::get().to(get_history))
                .route(web::delete().to(clear_history)),
        )
        .service(web::resource("/api/history/export").route(web::get().to(export_history)))
        .service(
            web::resource("/api/history/{detection_id}")
                .route(web::get().to(get_history_item))
                .route(web::delete().to(delete_history_item)),
        )
        .service(
            web::resource("/api/history/{detection_id}/flag")
                .route(web::post().to(flag_history_item)),
        )
        .service(web::resource("/api/admin/stats").route(web::get().to(admin_stats)));
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "ok"}))
}

async fn handle_predict(
    user: AuthenticatedUser,
    predictor: web::Data<Predictor>,
    db_repo: web::Data<SqliteRepository>,
    media_store: web::Data<MediaStore>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    let mut mime_types: Vec<String> = Vec::new();
    let mut latitude: Option<f64> = None;
    let mut longitude: Option<f64> = None;

    while let Ok(Some(mut field)) = payload.try_next().await {
        let field_name = field.name().unwrap_or("").to_string();
        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(|name| name.to_string());
        let mime_type = field
            .content_type()
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let bytes = chunk?;
            data.write_all(&bytes)?;
        }

        match field_name.as_str() {
            "latitude" => latitude = String::from_utf8_lossy(&data).trim().parse().ok(),
            "longitude" => longitude = String::from_utf8_lossy(&data).trim().parse().ok(),
            _ => {
                if !data.is_empty() {
                    files.push((
                        filename.unwrap_or_else(|| format!("upload-{}", files.len())),
                        data,
                    ));
                    mime_types.push(mime_type);
                }
            }
        }
    }

    if files.is_empty() {
        return Ok(HttpResponse::BadRequest().json(ErrorResponse {
            error: "no images provided".to_string(),
        }));
    }
    for ((filename, _), mime_type) in files.iter().zip(&mime_types) {
        if MediaStore::extract_file_extension(mime_type).is_err() {
            return Ok(HttpResponse::BadRequest().json(ErrorResponse {
                error: format!("unsupported content type {mime_type} for {filename}"),
            }));
        }
    }

    // Fail-fast: the first bad image aborts the whole batch, and nothing is
    // persisted for any image in a failed batch.
    let results = match predictor.predict_batch(&files) {
        Ok(results) => results,
        Err(e) => {
            let mut response = match &e {
                PredictionError::Preprocess(PreprocessError::Decode(_)) => {
                    warn!("Rejected upload: {e}");
                    HttpResponse::BadRequest()
                }
                PredictionError::Preprocess(PreprocessError::ShapeMismatch { .. }) => {
                    error!("Normalizer invariant violated: {e}");
                    HttpResponse::BadRequest()
                }
                PredictionError::Classifier(_) => {
                    error!("Model inference error: {e}");
                    HttpResponse::InternalServerError()
                }
            };
            return Ok(response.json(ErrorResponse {
                error: e.to_string(),
            }));
        }
    };

    for (result, ((_, bytes), mime_type)) in results.iter().zip(files.iter().zip(&mime_types)) {
        let image_path = match media_store.save_image(user.0, bytes, mime_type) {
            Ok(key) => key,
            Err(e) => {
                error!("Failed to store uploaded image: {e}");
                return Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                    error: "failed to store uploaded image".to_string(),
                }));
            }
        };
        let record = DetectionRecord::new(
            user.0,
            image_path,
            result.predicted_class.clone(),
            result.confidence_score,
            latitude,
            longitude,
        );
        if let Err(e) = db_repo.create_detection(&record).await {
            error!("Failed to persist detection record: {e}");
            return Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to persist detection record".to_string(),
            }));
        }
    }
    info!("Classified {} image(s) for user {}", results.len(), user.0);

    Ok(HttpResponse::Ok().json(results))
}

async fn get_history(
    user: AuthenticatedUser,
    db_repo: web::Data<SqliteRepository>,
) -> Result<HttpResponse, Error> {
    match db_repo.list_detections(user.0).await {
        Ok(records) => Ok(HttpResponse::Ok().json(records)),
        Err(e) => {
            error!("Failed to list history for {}: {e}", user.0);
            Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to load history".to_string(),
            }))
        }
    }
}

fn parse_detection_id(raw: &str) -> Result<Uuid, HttpResponse> {
    Uuid::parse_str(raw).map_err(|_| HttpResponse::BadRequest().body("Invalid UUID format"))
}

async fn get_history_item(
    user: AuthenticatedUser,
    db_repo: web::Data<SqliteRepository>,
    path: web::Path<String>,
) -> Result<HttpResponse, Error> {
    let detection_id = match parse_detection_id(&path.into_inner()) {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    match db_repo.get_detection(user.0, detection_id).await {
        Ok(Some(record)) => Ok(HttpResponse::Ok().json(record)),
        Ok(None) => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: "detection not found".to_string(),
        })),
        Err(e) => {
            error!("Error retrieving detection {detection_id}: {e}");
            Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to load detection".to_string(),
            }))
        }
    }
}

async fn flag_history_item(
    user: AuthenticatedUser,
    db_repo: web::Data<SqliteRepository>,
    path: web::Path<String>,
    request: web::Json<FlagRequest>,
) -> Result<HttpResponse, Error> {
    let detection_id = match parse_detection_id(&path.into_inner()) {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    match db_repo
        .flag_detection(user.0, detection_id, &request.reason)
        .await
    {
        Ok(true) => match db_repo.get_detection(user.0, detection_id).await {
            Ok(Some(record)) => Ok(HttpResponse::Ok().json(record)),
            _ => Ok(HttpResponse::Ok().json(json!({"flagged": true}))),
        },
        Ok(false) => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: "detection not found".to_string(),
        })),
        Err(e) => {
            error!("Error flagging detection {detection_id}: {e}");
            Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to flag detection".to_string(),
            }))
        }
    }
}

async fn delete_history_item(
    user: AuthenticatedUser,
    db_repo: web::Data<SqliteRepository>,
    media_store: web::Data<MediaStore>,
    path: web::Path<String>,
) -> Result<HttpResponse, Error> {
    let detection_id = match parse_detection_id(&path.into_inner()) {
        Ok(id) => id,
        Err(response) => return Ok(response),
    };
    let record = match db_repo.get_detection(user.0, detection_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return Ok(HttpResponse::NotFound().json(ErrorResponse {
                error: "detection not found".to_string(),
            }));
        }
        Err(e) => {
            error!("Error loading detection {detection_id} for delete: {e}");
            return Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to delete detection".to_string(),
            }));
        }
    };

    if let Err(e) = media_store.delete_image(&record.image_path) {
        warn!("Failed to remove stored image {}: {e}", record.image_path);
    }
    match db_repo.delete_detection(user.0, detection_id).await {
        Ok(_) => Ok(HttpResponse::Ok().json(json!({"deleted": true}))),
        Err(e) => {
            error!("Error deleting detection {detection_id}: {e}");
            Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to delete detection".to_string(),
            }))
        }
    }
}

async fn clear_history(
    user: AuthenticatedUser,
    db_repo: web::Data<SqliteRepository>,
    media_store: web::Data<MediaStore>,
) -> Result<HttpResponse, Error> {
    let image_keys: Vec<String> = match db_repo.list_detections(user.0).await {
        Ok(records) => records.into_iter().map(|r| r.image_path).collect(),
        Err(e) => {
            error!("Failed to list history for {} before clearing: {e}", user.0);
            return Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to clear history".to_string(),
            }));
        }
    };
    if let Err(e) = media_store.delete_images(&image_keys) {
        warn!("Failed to remove stored images for {}: {e}", user.0);
    }

    match db_repo.delete_user_detections(user.0).await {
        Ok(deleted) => {
            info!("Cleared {deleted} detection(s) for user {}", user.0);
            Ok(HttpResponse::Ok().json(json!({"deleted": deleted})))
        }
        Err(e) => {
            error!("Error clearing history for {}: {e}", user.0);
            Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to clear history".to_string(),
            }))
        }
    }
}

fn detections_to_csv(records: &[DetectionRecord]) -> Result<Vec<u8>, csv::Error> {
    let mut buffer = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buffer);
        writer.write_record([
            "id",
            "label",
            "confidence",
            "latitude",
            "longitude",
            "flagged",
            "flag_reason",
            "created_at",
        ])?;
        for record in records {
            writer.write_record(&[
                record.id.to_string(),
                record.label.clone(),
                record.confidence.to_string(),
                record.latitude.map(|v| v.to_string()).unwrap_or_default(),
                record.longitude.map(|v| v.to_string()).unwrap_or_default(),
                record.flagged.to_string(),
                record.flag_reason.clone().unwrap_or_default(),
                record.created_at.to_rfc3339(),
            ])?;
        }
        writer.flush()?;
    }
    Ok(buffer)
}

async fn export_history(
    user: AuthenticatedUser,
    db_repo: web::Data<SqliteRepository>,
) -> Result<HttpResponse, Error> {
    let records = match db_repo.list_detections(user.0).await {
        Ok(records) => records,
        Err(e) => {
            error!("Failed to list history for {} export: {e}", user.0);
            return Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to export history".to_string(),
            }));
        }
    };
    match detections_to_csv(&records) {
        Ok(body) => Ok(HttpResponse::Ok()
            .content_type("text/csv; charset=utf-8")
            .insert_header((
                "Content-Disposition",
                "attachment; filename=\"detections.csv\"",
            ))
            .body(body)),
        Err(e) => {
            error!("CSV export failed for {}: {e}", user.0);
            Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to export history".to_string(),
            }))
        }
    }
}

async fn admin_stats(
    user: AuthenticatedUser,
    db_repo: web::Data<SqliteRepository>,
) -> Result<HttpResponse, Error> {
    match db_repo.get_user_by_id(user.0).await {
        Ok(Some(current)) if current.is_admin => {}
        Ok(_) => {
            return Ok(HttpResponse::Forbidden().json(ErrorResponse {
                error: "admin access required".to_string(),
            }));
        }
        Err(e) => {
            error!("Failed to load user {} for admin check: {e}", user.0);
            return Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to load stats".to_string(),
            }));
        }
    }

    let stats = async {
        let users = db_repo.count_users().await?;
        let detections = db_repo.count_detections().await?;
        let flagged = db_repo.count_flagged().await?;
        let labels = db_repo.label_counts().await?;
        Ok::<_, crate::db::repository::RepositoryError>((users, detections, flagged, labels))
    }
    .await;

    match stats {
        Ok((users, detections, flagged, labels)) => {
            let labels: serde_json::Map<String, serde_json::Value> = labels
                .into_iter()
                .map(|(label, count)| (label, json!(count)))
                .collect();
            Ok(HttpResponse::Ok().json(json!({
                "users": users,
                "detections": detections,
                "flagged": flagged,
                "labels": labels,
            })))
        }
        Err(e) => {
            error!("Failed to compute admin stats: {e}");
            Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "failed to load stats".to_string(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn csv_export_includes_header_and_one_row_per_record() {
        let user_id = Uuid::new_v4();
        let mut first = DetectionRecord::new(
            user_id,
            "images/x/a.jpg".to_string(),
            "Tomato__early_blight".to_string(),
            0.9912,
            Some(-6.2),
            Some(106.8),
        );
        first.created_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut second = DetectionRecord::new(
            user_id,
            "images/x/b.jpg".to_string(),
            "Tomato__healthy".to_string(),
            0.75,
            None,
            None,
        );
        second.flagged = true;
        second.flag_reason = Some("looks wrong".to_string());

        let csv_bytes = detections_to_csv(&[first, second]).unwrap();
        let text = String::from_utf8(csv_bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,label,confidence"));
        assert!(lines[1].contains("Tomato__early_blight"));
        assert!(lines[1].contains("0.9912"));
        assert!(lines[2].contains("looks wrong"));
        // Absent coordinates serialize as empty cells, not zeros.
        assert!(lines[2].contains(",,"));
    }

    #[test]
    fn empty_history_exports_header_only() {
        let csv_bytes = detections_to_csv(&[]).unwrap();
        let text = String::from_utf8(csv_bytes).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn detection_id_parsing_rejects_garbage() {
        assert!(parse_detection_id("not-a-uuid").is_err());
        let id = Uuid::new_v4();
        assert_eq!(parse_detection_id(&id.to_string()).unwrap(), id);
    }
}
