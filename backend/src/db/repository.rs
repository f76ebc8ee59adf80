use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use uuid::Uuid;

use super::models::{DetectionRecord, User};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("item not found")]
    NotFound,
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("invalid data format: {0}")]
    InvalidData(String),
}

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

fn parse_uuid(value: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(value)
        .map_err(|e| RepositoryError::InvalidData(format!("invalid uuid {value:?}: {e}")))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::InvalidData(format!("invalid timestamp {value:?}: {e}")))
}

fn map_user(row: &SqliteRow) -> Result<User, RepositoryError> {
    Ok(User {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        is_admin: row.try_get("is_admin")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn map_detection(row: &SqliteRow) -> Result<DetectionRecord, RepositoryError> {
    Ok(DetectionRecord {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        user_id: parse_uuid(&row.try_get::<String, _>("user_id")?)?,
        image_path: row.try_get("image_path")?,
        label: row.try_get("label")?,
        confidence: row.try_get("confidence")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        flagged: row.try_get("flagged")?,
        flag_reason: row.try_get("flag_reason")?,
    })
}

fn map_insert_error(e: sqlx::Error, what: &str) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            RepositoryError::Conflict(what.to_string())
        }
        _ => RepositoryError::Database(e),
    }
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // User operations

    pub async fn create_user(&self, user: &User) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, first_name, last_name, \
             is_admin, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.is_admin)
        .bind(user.created_at.to_rfc3339())
        .bind(user.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, "username or email"))?;
        Ok(())
    }

    pub async fn get_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_user).transpose()
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User, RepositoryError> {
        self.get_user_by_id(user_id)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    pub async fn get_user_by_username(
        &self,
        username: &str,
    ) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_user).transpose()
    }

    pub async fn update_user_profile(
        &self,
        user_id: Uuid,
        email: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE users SET email = ?, first_name = ?, last_name = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(email)
        .bind(first_name)
        .bind(last_name)
        .bind(Utc::now().to_rfc3339())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, "email"))?;
        Ok(())
    }

    pub async fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(password_hash)
            .bind(Utc::now().to_rfc3339())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_user(&self, user_id: Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    pub async fn count_users(&self) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // Detection operations, all owner-scoped.

    pub async fn create_detection(&self, record: &DetectionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO detections (id, user_id, image_path, label, confidence, latitude, \
             longitude, created_at, flagged, flag_reason) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.user_id.to_string())
        .bind(&record.image_path)
        .bind(&record.label)
        .bind(record.confidence)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.created_at.to_rfc3339())
        .bind(record.flagged)
        .bind(&record.flag_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_detections(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<DetectionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM detections WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_detection).collect()
    }

    pub async fn get_detection(
        &self,
        user_id: Uuid,
        detection_id: Uuid,
    ) -> Result<Option<DetectionRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM detections WHERE id = ? AND user_id = ?")
            .bind(detection_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_detection).transpose()
    }

    pub async fn flag_detection(
        &self,
        user_id: Uuid,
        detection_id: Uuid,
        reason: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE detections SET flagged = 1, flag_reason = ? WHERE id = ? AND user_id = ?",
        )
        .bind(reason)
        .bind(detection_id.to_string())
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_detection(
        &self,
        user_id: Uuid,
        detection_id: Uuid,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM detections WHERE id = ? AND user_id = ?")
            .bind(detection_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_user_detections(&self, user_id: Uuid) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM detections WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_detections(&self) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM detections")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn count_flagged(&self) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM detections WHERE flagged = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn label_counts(&self) -> Result<Vec<(String, i64)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT label, COUNT(*) AS n FROM detections GROUP BY label ORDER BY n DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("label")?, row.try_get("n")?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn test_repository() -> SqliteRepository {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        crate::db::schema::init_schema(&pool).await.unwrap();
        SqliteRepository::new(pool)
    }

    fn test_user(username: &str) -> User {
        User::new(
            username.to_string(),
            format!("{username}@example.com"),
            "hash".to_string(),
            "Test".to_string(),
            "User".to_string(),
            false,
        )
    }

    fn detection_at(user_id: Uuid, label: &str, secs: i64) -> DetectionRecord {
        let mut record = DetectionRecord::new(
            user_id,
            format!("images/{user_id}/x.jpg"),
            label.to_string(),
            0.9,
            None,
            None,
        );
        record.created_at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        record
    }

    #[actix_web::test]
    async fn user_roundtrip_and_duplicate_rejection() {
        let repo = test_repository().await;
        let user = test_user("alice");
        repo.create_user(&user).await.unwrap();

        let loaded = repo.get_user_by_username("alice").await.unwrap().unwrap();
        assert_eq!(loaded.id, user.id);
        assert_eq!(loaded.email, "alice@example.com");
        assert!(!loaded.is_admin);

        let duplicate = test_user("alice");
        assert!(matches!(
            repo.create_user(&duplicate).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[actix_web::test]
    async fn history_is_owner_scoped_and_newest_first() {
        let repo = test_repository().await;
        let alice = test_user("alice");
        let bob = test_user("bob");
        repo.create_user(&alice).await.unwrap();
        repo.create_user(&bob).await.unwrap();

        repo.create_detection(&detection_at(alice.id, "Apple__scab", 1))
            .await
            .unwrap();
        repo.create_detection(&detection_at(alice.id, "Apple__healthy", 2))
            .await
            .unwrap();
        repo.create_detection(&detection_at(bob.id, "Wheat__septoria", 3))
            .await
            .unwrap();

        let history = repo.list_detections(alice.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].label, "Apple__healthy");
        assert_eq!(history[1].label, "Apple__scab");
    }

    #[actix_web::test]
    async fn delete_removes_record_from_history() {
        let repo = test_repository().await;
        let alice = test_user("alice");
        repo.create_user(&alice).await.unwrap();
        let record = detection_at(alice.id, "Tea__anthracnose", 0);
        repo.create_detection(&record).await.unwrap();

        assert!(repo.delete_detection(alice.id, record.id).await.unwrap());
        assert!(repo.list_detections(alice.id).await.unwrap().is_empty());
        // Second delete is a no-op.
        assert!(!repo.delete_detection(alice.id, record.id).await.unwrap());
    }

    #[actix_web::test]
    async fn delete_is_denied_for_non_owners() {
        let repo = test_repository().await;
        let alice = test_user("alice");
        let bob = test_user("bob");
        repo.create_user(&alice).await.unwrap();
        repo.create_user(&bob).await.unwrap();
        let record = detection_at(alice.id, "Corn__common_rust", 0);
        repo.create_detection(&record).await.unwrap();

        assert!(!repo.delete_detection(bob.id, record.id).await.unwrap());
        assert_eq!(repo.list_detections(alice.id).await.unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn bulk_delete_counts_only_owned_records() {
        let repo = test_repository().await;
        let alice = test_user("alice");
        let bob = test_user("bob");
        repo.create_user(&alice).await.unwrap();
        repo.create_user(&bob).await.unwrap();
        for i in 0..3 {
            repo.create_detection(&detection_at(alice.id, "Rice__hispa", i))
                .await
                .unwrap();
        }
        repo.create_detection(&detection_at(bob.id, "Rice__healthy", 9))
            .await
            .unwrap();

        assert_eq!(repo.delete_user_detections(alice.id).await.unwrap(), 3);
        assert_eq!(repo.list_detections(bob.id).await.unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn flagging_sets_reason() {
        let repo = test_repository().await;
        let alice = test_user("alice");
        repo.create_user(&alice).await.unwrap();
        let record = detection_at(alice.id, "Grape__black_rot", 0);
        repo.create_detection(&record).await.unwrap();

        assert!(
            repo.flag_detection(alice.id, record.id, "wrong label")
                .await
                .unwrap()
        );
        let loaded = repo.get_detection(alice.id, record.id).await.unwrap().unwrap();
        assert!(loaded.flagged);
        assert_eq!(loaded.flag_reason.as_deref(), Some("wrong label"));
        assert_eq!(repo.count_flagged().await.unwrap(), 1);
    }

    #[actix_web::test]
    async fn deleting_a_user_cascades_to_detections() {
        let repo = test_repository().await;
        let alice = test_user("alice");
        repo.create_user(&alice).await.unwrap();
        repo.create_detection(&detection_at(alice.id, "Mango__diseased", 0))
            .await
            .unwrap();

        repo.delete_user(alice.id).await.unwrap();
        assert_eq!(repo.count_detections().await.unwrap(), 0);
        assert!(repo.get_user_by_id(alice.id).await.unwrap().is_none());
    }

    #[actix_web::test]
    async fn label_counts_aggregate_across_users() {
        let repo = test_repository().await;
        let alice = test_user("alice");
        let bob = test_user("bob");
        repo.create_user(&alice).await.unwrap();
        repo.create_user(&bob).await.unwrap();
        repo.create_detection(&detection_at(alice.id, "Potato__late_blight", 0))
            .await
            .unwrap();
        repo.create_detection(&detection_at(bob.id, "Potato__late_blight", 1))
            .await
            .unwrap();
        repo.create_detection(&detection_at(bob.id, "Potato__healthy", 2))
            .await
            .unwrap();

        let counts = repo.label_counts().await.unwrap();
        assert_eq!(counts[0], ("Potato__late_blight".to_string(), 2));
        assert_eq!(counts[1], ("Potato__healthy".to_string(), 1));
    }
}
