use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::database::{Client, ClientFilter, DatabaseProvider, Page};
use crate::errors::{EdgeError, Result};

pub fn client_dir(media_root: &Path, face_id: &str) -> PathBuf {
    media_root.join("clients").join(face_id)
}

/// Deletes the client record, its videos and its media directory
pub async fn remove_client(database: &dyn DatabaseProvider, client: &Client) -> Result<()> {
    database.delete_client(client.id).await?;
    match tokio::fs::remove_dir_all(&client.directory).await {
        Ok(()) => debug!("Removed client directory '{}'", client.directory),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove client directory '{}': {}", client.directory, e),
    }
    info!("Removed client {} ({})", client.id, client.face_id);
    Ok(())
}

/// Removes every client created more than `retention` ago
pub async fn cleanup_expired(database: &dyn DatabaseProvider, retention: Duration) -> Result<Vec<Client>> {
    let retention = chrono::Duration::from_std(retention)
        .map_err(|e| EdgeError::config(format!("invalid client retention: {}", e)))?;
    let filter = ClientFilter {
        created_before: Some(Utc::now() - retention),
        ..ClientFilter::default()
    };
    let expired = database.list_clients(&filter, Page::all()).await?;

    let mut removed = Vec::with_capacity(expired.len());
    for client in expired {
        match remove_client(database, &client).await {
            Ok(()) => removed.push(client),
            Err(e) => warn!("Failed to remove expired client {}: {}", client.id, e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteDatabase;

    fn client(face_id: &str, dir: &Path, age: chrono::Duration) -> Client {
        Client {
            id: 0,
            face_id: face_id.to_string(),
            camera_id: 1,
            is_on_lane: true,
            directory: dir.to_string_lossy().to_string(),
            created_at: Utc::now() - age,
            removed_at: None,
        }
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteDatabase::new(dir.path().join("c.db").to_str().unwrap()).await.unwrap();
        db.initialize().await.unwrap();

        let old_dir = client_dir(dir.path(), "old");
        let new_dir = client_dir(dir.path(), "new");
        tokio::fs::create_dir_all(old_dir.join("faces")).await.unwrap();
        tokio::fs::create_dir_all(&new_dir).await.unwrap();

        db.create_client(&client("old", &old_dir, chrono::Duration::days(10))).await.unwrap();
        let kept = db.create_client(&client("new", &new_dir, chrono::Duration::minutes(5))).await.unwrap();

        let removed = cleanup_expired(&db, Duration::from_secs(7 * 24 * 3600)).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].face_id, "old");
        assert!(!old_dir.exists());
        assert!(new_dir.exists());
        assert!(db.find_client(kept).await.unwrap().is_some());
    }
}
