use actix_web::{HttpResponse, Result, web};
use log::error;

use crate::AppConfig;
use crate::db::models::User;
use crate::db::repository::{RepositoryError, SqliteRepository};
use crate::storage::media_store::MediaStore;

use super::jwt::JwtService;
use super::middleware::AuthenticatedUser;
use super::models::{
    AuthResponse, AuthUser, ChangePasswordRequest, LoginRequest, ProfileUpdateRequest,
    RegisterRequest,
};
use super::password;

#[derive(serde::Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_json(message: &str) -> ErrorResponse {
    ErrorResponse {
        error: message.to_string(),
    }
}

pub async fn register(
    request: web::Json<RegisterRequest>,
    db_repo: web::Data<SqliteRepository>,
    jwt_service: web::Data<JwtService>,
    config: web::Data<AppConfig>,
) -> Result<HttpResponse> {
    let request = request.into_inner();
    if request.username.trim().is_empty() || request.password.is_empty() {
        return Ok(HttpResponse::BadRequest()
            .json(error_json("username and password are required")));
    }
    if request.email.trim().is_empty() || !request.email.contains('@') {
        return Ok(HttpResponse::BadRequest().json(error_json("a valid email is required")));
    }

    let password_hash = match password::hash_password(&request.password) {
        Ok(hash) => hash,
        Err(e) => {
            error!("Password hashing failed during registration: {e}");
            return Ok(
                HttpResponse::InternalServerError().json(error_json("registration failed"))
            );
        }
    };

    let email = request.email.trim().to_string();
    let is_admin = config
        .admin_emails
        .iter()
        .any(|admin| admin.eq_ignore_ascii_case(&email));
    let user = User::new(
        request.username.trim().to_string(),
        email,
        password_hash,
        request.first_name,
        request.last_name,
        is_admin,
    );

    match db_repo.create_user(&user).await {
        Ok(()) => {
            log::info!("Registered user {} ({})", user.username, user.id);
            let auth_user = AuthUser::from(user);
            match jwt_service.generate_token(&auth_user) {
                Ok(token) => Ok(HttpResponse::Created().json(AuthResponse {
                    token,
                    user: auth_user,
                })),
                Err(e) => {
                    error!("Token generation failed after registration: {e}");
                    Ok(HttpResponse::InternalServerError().json(error_json("registration failed")))
                }
            }
        }
        Err(RepositoryError::Conflict(_)) => Ok(HttpResponse::Conflict()
            .json(error_json("username or email is already taken"))),
        Err(e) => {
            error!("Failed to create user: {e}");
            Ok(HttpResponse::InternalServerError().json(error_json("registration failed")))
        }
    }
}

pub async fn login(
    request: web::Json<LoginRequest>,
    db_repo: web::Data<SqliteRepository>,
    jwt_service: web::Data<JwtService>,
) -> Result<HttpResponse> {
    let request = request.into_inner();

    let user = match db_repo.get_user_by_username(&request.username).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            // Same response as a bad password: don't leak which usernames exist.
            return Ok(HttpResponse::Unauthorized()
                .json(error_json("invalid username or password")));
        }
        Err(e) => {
            error!("Login lookup failed for {}: {e}", request.username);
            return Ok(HttpResponse::InternalServerError().json(error_json("login failed")));
        }
    };

    if !password::verify_password(&request.password, &user.password_hash) {
        return Ok(HttpResponse::Unauthorized().json(error_json("invalid username or password")));
    }

    let auth_user = AuthUser::from(user);
    match jwt_service.generate_token(&auth_user) {
        Ok(token) => Ok(HttpResponse::Ok().json(AuthResponse {
            token,
            user: auth_user,
        })),
        Err(e) => {
            error!("Token generation failed at login: {e}");
            Ok(HttpResponse::InternalServerError().json(error_json("login failed")))
        }
    }
}

pub async fn profile(
    user: AuthenticatedUser,
    db_repo: web::Data<SqliteRepository>,
) -> Result<HttpResponse> {
    match db_repo.get_user_by_id(user.0).await {
        Ok(Some(user_data)) => Ok(HttpResponse::Ok().json(AuthUser::from(user_data))),
        Ok(None) => Ok(HttpResponse::NotFound().json(error_json("user not found"))),
        Err(e) => {
            error!("Failed to fetch user data for ID {}: {e}", user.0);
            Ok(HttpResponse::InternalServerError().json(error_json("failed to load profile")))
        }
    }
}

pub async fn update_profile(
    user: AuthenticatedUser,
    request: web::Json<ProfileUpdateRequest>,
    db_repo: web::Data<SqliteRepository>,
) -> Result<HttpResponse> {
    let current = match db_repo.get_user_by_id(user.0).await {
        Ok(Some(current)) => current,
        Ok(None) => return Ok(HttpResponse::NotFound().json(error_json("user not found"))),
        Err(e) => {
            error!("Failed to fetch user {} for update: {e}", user.0);
            return Ok(
                HttpResponse::InternalServerError().json(error_json("profile update failed"))
            );
        }
    };

    let request = request.into_inner();
    let email = request.email.unwrap_or(current.email);
    let first_name = request.first_name.unwrap_or(current.first_name);
    let last_name = request.last_name.unwrap_or(current.last_name);

    match db_repo
        .update_user_profile(user.0, &email, &first_name, &last_name)
        .await
    {
        Ok(()) => match db_repo.get_user(user.0).await {
            Ok(updated) => Ok(HttpResponse::Ok().json(AuthUser::from(updated))),
            Err(e) => {
                error!("Failed to reload user {} after update: {e}", user.0);
                Ok(HttpResponse::InternalServerError().json(error_json("profile update failed")))
            }
        },
        Err(RepositoryError::Conflict(_)) => {
            Ok(HttpResponse::Conflict().json(error_json("email is already taken")))
        }
        Err(e) => {
            error!("Failed to update user {}: {e}", user.0);
            Ok(HttpResponse::InternalServerError().json(error_json("profile update failed")))
        }
    }
}

pub async fn change_password(
    user: AuthenticatedUser,
    request: web::Json<ChangePasswordRequest>,
    db_repo: web::Data<SqliteRepository>,
) -> Result<HttpResponse> {
    let current = match db_repo.get_user_by_id(user.0).await {
        Ok(Some(current)) => current,
        Ok(None) => return Ok(HttpResponse::NotFound().json(error_json("user not found"))),
        Err(e) => {
            error!("Failed to fetch user {} for password change: {e}", user.0);
            return Ok(
                HttpResponse::InternalServerError().json(error_json("password change failed"))
            );
        }
    };

    if !password::verify_password(&request.old_password, &current.password_hash) {
        return Ok(HttpResponse::BadRequest().json(error_json("old password is incorrect")));
    }
    if request.new_password.is_empty() {
        return Ok(HttpResponse::BadRequest().json(error_json("new password must not be empty")));
    }

    let new_hash = match password::hash_password(&request.new_password) {
        Ok(hash) => hash,
        Err(e) => {
            error!("Password hashing failed for {}: {e}", user.0);
            return Ok(
                HttpResponse::InternalServerError().json(error_json("password change failed"))
            );
        }
    };

    match db_repo.update_password(user.0, &new_hash).await {
        Ok(()) => Ok(HttpResponse::Ok().json(serde_json::json!({"changed": true}))),
        Err(e) => {
            error!("Failed to store new password for {}: {e}", user.0);
            Ok(HttpResponse::InternalServerError().json(error_json("password change failed")))
        }
    }
}

pub async fn delete_account(
    user: AuthenticatedUser,
    db_repo: web::Data<SqliteRepository>,
    media_store: web::Data<MediaStore>,
) -> Result<HttpResponse> {
    // Stored images go first; the user row cascades over the detection rows.
    let image_keys: Vec<String> = match db_repo.list_detections(user.0).await {
        Ok(records) => records.into_iter().map(|r| r.image_path).collect(),
        Err(e) => {
            error!("Failed to list detections for account deletion {}: {e}", user.0);
            return Ok(
                HttpResponse::InternalServerError().json(error_json("account deletion failed"))
            );
        }
    };
    if let Err(e) = media_store.delete_images(&image_keys) {
        log::warn!("Failed to remove stored images for {}: {e}", user.0);
    }

    match db_repo.delete_user(user.0).await {
        Ok(()) => {
            log::info!("Deleted account {}", user.0);
            Ok(HttpResponse::Ok().json(serde_json::json!({"deleted": true})))
        }
        Err(RepositoryError::NotFound) => {
            Ok(HttpResponse::NotFound().json(error_json("user not found")))
        }
        Err(e) => {
            error!("Failed to delete account {}: {e}", user.0);
            Ok(HttpResponse::InternalServerError().json(error_json("account deletion failed")))
        }
    }
}
