use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        username: String,
        email: String,
        password_hash: String,
        first_name: String,
        last_name: String,
        is_admin: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            username,
            email,
            password_hash,
            first_name,
            last_name,
            is_admin,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One persisted prediction event. Owned exclusively by the creating user;
/// mutated only to set the flag fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub image_path: String,
    pub label: String,
    pub confidence: f32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub flagged: bool,
    pub flag_reason: Option<String>,
}

impl DetectionRecord {
    pub fn new(
        user_id: Uuid,
        image_path: String,
        label: String,
        confidence: f32,
        latitude: Option<f64>,
        longitude: Option<f64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            image_path,
            label,
            confidence,
            latitude,
            longitude,
            created_at: Utc::now(),
            flagged: false,
            flag_reason: None,
        }
    }
}
