use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, Row};
use sqlx::sqlite::SqliteRow;
use crate::config::{CameraTuning, Credentials};
use crate::errors::{Result, EdgeError};

const TABLE_CAMERAS: &str = "cameras";
const TABLE_CLIENTS: &str = "clients";
const TABLE_VIDEOS: &str = "videos";
const TABLE_CONFIG: &str = "config";

/// Network identity of a camera; the (ip, port) pair is the map key everywhere
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraEndpoint {
    pub ip: String,
    pub port: u16,
}

impl CameraEndpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl std::fmt::Display for CameraEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Attachment {
    Unattached,
    Lane(String),
    Kiosk(i64),
}

#[derive(Debug, Clone, Serialize)]
pub struct Camera {
    pub id: i64,
    pub ip: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub stream_uri: Option<String>,
    pub connected: bool,
    pub streaming: bool,
    pub lane_name: Option<String>,
    pub kiosk_id: Option<i64>,
    pub tuning: CameraTuning,
    pub created_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

impl Camera {
    pub fn new(endpoint: &CameraEndpoint, credentials: Option<&Credentials>, stream_uri: Option<String>) -> Self {
        Self {
            id: 0,
            ip: endpoint.ip.clone(),
            port: endpoint.port,
            username: credentials.map(|c| c.username.clone()),
            password: credentials.map(|c| c.password.clone()),
            stream_uri,
            connected: true,
            streaming: false,
            lane_name: None,
            kiosk_id: None,
            tuning: CameraTuning::default(),
            created_at: Utc::now(),
            disconnected_at: None,
        }
    }

    pub fn endpoint(&self) -> CameraEndpoint {
        CameraEndpoint::new(self.ip.clone(), self.port)
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn attachment(&self) -> Attachment {
        match (&self.lane_name, self.kiosk_id) {
            (Some(lane), None) => Attachment::Lane(lane.clone()),
            (None, Some(kiosk)) => Attachment::Kiosk(kiosk),
            _ => Attachment::Unattached,
        }
    }

    pub fn attach_lane(&mut self, lane_name: impl Into<String>) {
        self.kiosk_id = None;
        self.lane_name = Some(lane_name.into());
    }

    pub fn attach_kiosk(&mut self, kiosk_id: i64) {
        self.lane_name = None;
        self.kiosk_id = Some(kiosk_id);
    }

    pub fn detach(&mut self) {
        self.lane_name = None;
        self.kiosk_id = None;
    }

    /// lane_name and kiosk_id are mutually exclusive
    pub fn check_invariant(&self) -> Result<()> {
        if self.lane_name.is_some() && self.kiosk_id.is_some() {
            return Err(EdgeError::invariant(format!(
                "camera {} is attached to both a lane and a kiosk", self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Client {
    pub id: i64,
    pub face_id: String,
    pub camera_id: i64,
    pub is_on_lane: bool,
    pub directory: String,
    pub created_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoKind {
    Master,
    Clip,
    Photo,
}

impl From<String> for VideoKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "master" => VideoKind::Master,
            "photo" => VideoKind::Photo,
            _ => VideoKind::Clip,
        }
    }
}

impl From<VideoKind> for String {
    fn from(kind: VideoKind) -> Self {
        match kind {
            VideoKind::Master => "master".to_string(),
            VideoKind::Clip => "clip".to_string(),
            VideoKind::Photo => "photo".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Video {
    pub id: i64,
    pub client_id: i64,
    pub camera_id: i64,
    pub kind: VideoKind,
    pub path: String,
    pub start_secs: f64,
    pub end_secs: f64,
    pub sellable: bool,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub must_reboot: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CameraFilter {
    pub connected: Option<bool>,
    pub streaming: Option<bool>,
    pub lane_attached: Option<bool>,
    pub kiosk_attached: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientFilter {
    pub camera_id: Option<i64>,
    pub is_on_lane: Option<bool>,
    pub created_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub fn all() -> Self {
        Self { limit: -1, offset: 0 }
    }
}

#[async_trait]
pub trait DatabaseProvider: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    async fn create_camera(&self, camera: &Camera) -> Result<i64>;
    async fn find_camera(&self, id: i64) -> Result<Option<Camera>>;
    async fn find_camera_by_endpoint(&self, endpoint: &CameraEndpoint) -> Result<Option<Camera>>;
    async fn update_camera(&self, camera: &Camera) -> Result<()>;
    async fn delete_camera(&self, id: i64) -> Result<()>;
    async fn list_cameras(&self, filter: &CameraFilter, page: Page) -> Result<Vec<Camera>>;

    async fn create_client(&self, client: &Client) -> Result<i64>;
    async fn find_client(&self, id: i64) -> Result<Option<Client>>;
    async fn find_client_by_face_id(&self, face_id: &str) -> Result<Option<Client>>;
    async fn update_client(&self, client: &Client) -> Result<()>;
    async fn delete_client(&self, id: i64) -> Result<()>;
    async fn list_clients(&self, filter: &ClientFilter, page: Page) -> Result<Vec<Client>>;

    async fn create_video(&self, video: &Video) -> Result<i64>;
    async fn list_videos_for_client(&self, client_id: i64) -> Result<Vec<Video>>;

    async fn get_config(&self, key: &str) -> Result<Option<ConfigEntry>>;
    async fn set_config(&self, entry: &ConfigEntry) -> Result<()>;
    /// Returns true when the key was absent and has been inserted
    async fn insert_config_if_missing(&self, entry: &ConfigEntry) -> Result<bool>;
}

pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    pub async fn new(database_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", database_path);
        let pool = SqlitePool::connect(&database_url).await?;

        Ok(Self { pool })
    }

    fn camera_from_row(row: &SqliteRow) -> Result<Camera> {
        let tuning: Option<String> = row.get("tuning");
        let tuning = match tuning {
            Some(json) => serde_json::from_str(&json)?,
            None => CameraTuning::default(),
        };
        Ok(Camera {
            id: row.get("id"),
            ip: row.get("ip"),
            port: row.get::<i64, _>("port") as u16,
            username: row.get("username"),
            password: row.get("password"),
            stream_uri: row.get("stream_uri"),
            connected: row.get("connected"),
            streaming: row.get("streaming"),
            lane_name: row.get("lane_name"),
            kiosk_id: row.get("kiosk_id"),
            tuning,
            created_at: row.get("created_at"),
            disconnected_at: row.get("disconnected_at"),
        })
    }

    fn client_from_row(row: &SqliteRow) -> Client {
        Client {
            id: row.get("id"),
            face_id: row.get("face_id"),
            camera_id: row.get("camera_id"),
            is_on_lane: row.get("is_on_lane"),
            directory: row.get("directory"),
            created_at: row.get("created_at"),
            removed_at: row.get("removed_at"),
        }
    }

    fn video_from_row(row: &SqliteRow) -> Result<Video> {
        let metadata: Option<String> = row.get("metadata");
        let metadata = match metadata {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        Ok(Video {
            id: row.get("id"),
            client_id: row.get("client_id"),
            camera_id: row.get("camera_id"),
            kind: VideoKind::from(row.get::<String, _>("kind")),
            path: row.get("path"),
            start_secs: row.get("start_secs"),
            end_secs: row.get("end_secs"),
            sellable: row.get("sellable"),
            metadata,
            created_at: row.get("created_at"),
        })
    }
}

fn bool_condition(column: &str, value: Option<bool>, conditions: &mut Vec<String>) {
    if let Some(v) = value {
        conditions.push(format!("{} = {}", column, if v { 1 } else { 0 }));
    }
}

fn null_condition(column: &str, attached: Option<bool>, conditions: &mut Vec<String>) {
    match attached {
        Some(true) => conditions.push(format!("{} IS NOT NULL", column)),
        Some(false) => conditions.push(format!("{} IS NULL", column)),
        None => {}
    }
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

#[async_trait]
impl DatabaseProvider for SqliteDatabase {
    async fn initialize(&self) -> Result<()> {
        let create_cameras_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT,
                password TEXT,
                stream_uri TEXT,
                connected BOOLEAN NOT NULL DEFAULT 0,
                streaming BOOLEAN NOT NULL DEFAULT 0,
                lane_name TEXT,
                kiosk_id INTEGER,
                tuning TEXT,
                created_at TIMESTAMP NOT NULL,
                disconnected_at TIMESTAMP,
                UNIQUE (ip, port),
                CHECK (lane_name IS NULL OR kiosk_id IS NULL)
            )
            "#,
            TABLE_CAMERAS
        );
        sqlx::query(&create_cameras_query)
            .execute(&self.pool)
            .await?;

        let create_clients_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                face_id TEXT NOT NULL UNIQUE,
                camera_id INTEGER NOT NULL,
                is_on_lane BOOLEAN NOT NULL DEFAULT 0,
                directory TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                removed_at TIMESTAMP
            )
            "#,
            TABLE_CLIENTS
        );
        sqlx::query(&create_clients_query)
            .execute(&self.pool)
            .await?;

        let create_videos_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id INTEGER NOT NULL,
                camera_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                path TEXT NOT NULL,
                start_secs REAL NOT NULL,
                end_secs REAL NOT NULL,
                sellable BOOLEAN NOT NULL,
                metadata TEXT,
                created_at TIMESTAMP NOT NULL,
                FOREIGN KEY (client_id) REFERENCES {}(id) ON DELETE CASCADE
            )
            "#,
            TABLE_VIDEOS, TABLE_CLIENTS
        );
        sqlx::query(&create_videos_query)
            .execute(&self.pool)
            .await?;

        let create_config_query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                must_reboot BOOLEAN NOT NULL DEFAULT 0
            )
            "#,
            TABLE_CONFIG
        );
        sqlx::query(&create_config_query)
            .execute(&self.pool)
            .await?;

        let idx_videos_client = format!(
            "CREATE INDEX IF NOT EXISTS idx_videos_client ON {}(client_id)",
            TABLE_VIDEOS
        );
        sqlx::query(&idx_videos_client)
            .execute(&self.pool)
            .await?;

        let idx_clients_created = format!(
            "CREATE INDEX IF NOT EXISTS idx_clients_created ON {}(created_at)",
            TABLE_CLIENTS
        );
        sqlx::query(&idx_clients_created)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_camera(&self, camera: &Camera) -> Result<i64> {
        camera.check_invariant()?;
        let tuning = serde_json::to_string(&camera.tuning)?;
        let query = format!(
            r#"
            INSERT INTO {} (ip, port, username, password, stream_uri, connected, streaming,
                            lane_name, kiosk_id, tuning, created_at, disconnected_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            TABLE_CAMERAS
        );
        let result = sqlx::query(&query)
            .bind(&camera.ip)
            .bind(camera.port as i64)
            .bind(&camera.username)
            .bind(&camera.password)
            .bind(&camera.stream_uri)
            .bind(camera.connected)
            .bind(camera.streaming)
            .bind(&camera.lane_name)
            .bind(camera.kiosk_id)
            .bind(tuning)
            .bind(camera.created_at)
            .bind(camera.disconnected_at)
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    async fn find_camera(&self, id: i64) -> Result<Option<Camera>> {
        let query = format!("SELECT * FROM {} WHERE id = ?", TABLE_CAMERAS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::camera_from_row).transpose()
    }

    async fn find_camera_by_endpoint(&self, endpoint: &CameraEndpoint) -> Result<Option<Camera>> {
        let query = format!("SELECT * FROM {} WHERE ip = ? AND port = ?", TABLE_CAMERAS);
        let row = sqlx::query(&query)
            .bind(&endpoint.ip)
            .bind(endpoint.port as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::camera_from_row).transpose()
    }

    async fn update_camera(&self, camera: &Camera) -> Result<()> {
        camera.check_invariant()?;
        let tuning = serde_json::to_string(&camera.tuning)?;
        let query = format!(
            r#"
            UPDATE {} SET username = ?, password = ?, stream_uri = ?, connected = ?, streaming = ?,
                          lane_name = ?, kiosk_id = ?, tuning = ?, disconnected_at = ?
            WHERE id = ?
            "#,
            TABLE_CAMERAS
        );
        let result = sqlx::query(&query)
            .bind(&camera.username)
            .bind(&camera.password)
            .bind(&camera.stream_uri)
            .bind(camera.connected)
            .bind(camera.streaming)
            .bind(&camera.lane_name)
            .bind(camera.kiosk_id)
            .bind(tuning)
            .bind(camera.disconnected_at)
            .bind(camera.id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EdgeError::not_found(format!("camera {}", camera.id)));
        }
        Ok(())
    }

    async fn delete_camera(&self, id: i64) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE id = ?", TABLE_CAMERAS);
        sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_cameras(&self, filter: &CameraFilter, page: Page) -> Result<Vec<Camera>> {
        let mut conditions = Vec::new();
        bool_condition("connected", filter.connected, &mut conditions);
        bool_condition("streaming", filter.streaming, &mut conditions);
        null_condition("lane_name", filter.lane_attached, &mut conditions);
        null_condition("kiosk_id", filter.kiosk_attached, &mut conditions);

        let sql = format!(
            "SELECT * FROM {}{} ORDER BY id ASC LIMIT ? OFFSET ?",
            TABLE_CAMERAS, where_clause(&conditions)
        );
        tracing::debug!("Executing SQL query for list_cameras: {}", sql);

        let rows = sqlx::query(&sql)
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::camera_from_row).collect()
    }

    async fn create_client(&self, client: &Client) -> Result<i64> {
        let query = format!(
            r#"
            INSERT INTO {} (face_id, camera_id, is_on_lane, directory, created_at, removed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            TABLE_CLIENTS
        );
        let result = sqlx::query(&query)
            .bind(&client.face_id)
            .bind(client.camera_id)
            .bind(client.is_on_lane)
            .bind(&client.directory)
            .bind(client.created_at)
            .bind(client.removed_at)
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    async fn find_client(&self, id: i64) -> Result<Option<Client>> {
        let query = format!("SELECT * FROM {} WHERE id = ?", TABLE_CLIENTS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::client_from_row))
    }

    async fn find_client_by_face_id(&self, face_id: &str) -> Result<Option<Client>> {
        let query = format!("SELECT * FROM {} WHERE face_id = ?", TABLE_CLIENTS);
        let row = sqlx::query(&query)
            .bind(face_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::client_from_row))
    }

    async fn update_client(&self, client: &Client) -> Result<()> {
        let query = format!(
            "UPDATE {} SET is_on_lane = ?, directory = ?, removed_at = ? WHERE id = ?",
            TABLE_CLIENTS
        );
        let result = sqlx::query(&query)
            .bind(client.is_on_lane)
            .bind(&client.directory)
            .bind(client.removed_at)
            .bind(client.id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EdgeError::not_found(format!("client {}", client.id)));
        }
        Ok(())
    }

    async fn delete_client(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let delete_videos = format!("DELETE FROM {} WHERE client_id = ?", TABLE_VIDEOS);
        sqlx::query(&delete_videos)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let delete_client = format!("DELETE FROM {} WHERE id = ?", TABLE_CLIENTS);
        sqlx::query(&delete_client)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_clients(&self, filter: &ClientFilter, page: Page) -> Result<Vec<Client>> {
        let mut conditions = Vec::new();
        if filter.camera_id.is_some() {
            conditions.push("camera_id = ?".to_string());
        }
        bool_condition("is_on_lane", filter.is_on_lane, &mut conditions);
        if filter.created_before.is_some() {
            conditions.push("created_at < ?".to_string());
        }

        let sql = format!(
            "SELECT * FROM {}{} ORDER BY created_at DESC LIMIT ? OFFSET ?",
            TABLE_CLIENTS, where_clause(&conditions)
        );
        tracing::debug!("Executing SQL query for list_clients: {}", sql);

        let mut query = sqlx::query(&sql);
        if let Some(camera_id) = filter.camera_id {
            query = query.bind(camera_id);
        }
        if let Some(before) = filter.created_before {
            query = query.bind(before);
        }
        let rows = query
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(Self::client_from_row).collect())
    }

    async fn create_video(&self, video: &Video) -> Result<i64> {
        let metadata = video.metadata.as_ref().map(serde_json::to_string).transpose()?;
        let query = format!(
            r#"
            INSERT INTO {} (client_id, camera_id, kind, path, start_secs, end_secs, sellable, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            TABLE_VIDEOS
        );
        let result = sqlx::query(&query)
            .bind(video.client_id)
            .bind(video.camera_id)
            .bind(String::from(video.kind))
            .bind(&video.path)
            .bind(video.start_secs)
            .bind(video.end_secs)
            .bind(video.sellable)
            .bind(metadata)
            .bind(video.created_at)
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    async fn list_videos_for_client(&self, client_id: i64) -> Result<Vec<Video>> {
        let query = format!(
            "SELECT * FROM {} WHERE client_id = ? ORDER BY start_secs ASC, id ASC",
            TABLE_VIDEOS
        );
        let rows = sqlx::query(&query)
            .bind(client_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::video_from_row).collect()
    }

    async fn get_config(&self, key: &str) -> Result<Option<ConfigEntry>> {
        let query = format!("SELECT key, value, must_reboot FROM {} WHERE key = ?", TABLE_CONFIG);
        let row = sqlx::query(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| ConfigEntry {
            key: row.get("key"),
            value: row.get("value"),
            must_reboot: row.get("must_reboot"),
        }))
    }

    async fn set_config(&self, entry: &ConfigEntry) -> Result<()> {
        let query = format!(
            r#"
            INSERT INTO {} (key, value, must_reboot) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, must_reboot = excluded.must_reboot
            "#,
            TABLE_CONFIG
        );
        sqlx::query(&query)
            .bind(&entry.key)
            .bind(&entry.value)
            .bind(entry.must_reboot)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_config_if_missing(&self, entry: &ConfigEntry) -> Result<bool> {
        let query = format!(
            "INSERT OR IGNORE INTO {} (key, value, must_reboot) VALUES (?, ?, ?)",
            TABLE_CONFIG
        );
        let result = sqlx::query(&query)
            .bind(&entry.key)
            .bind(&entry.value)
            .bind(entry.must_reboot)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_db(dir: &tempfile::TempDir) -> SqliteDatabase {
        let path = dir.path().join("edge.db");
        let db = SqliteDatabase::new(path.to_str().unwrap()).await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_camera_crud_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let endpoint = CameraEndpoint::new("192.168.1.20", 80);
        let creds = Credentials { username: "admin".into(), password: "admin".into() };
        let mut camera = Camera::new(&endpoint, Some(&creds), Some("rtsp://192.168.1.20/stream".into()));
        camera.id = db.create_camera(&camera).await.unwrap();

        let found = db.find_camera_by_endpoint(&endpoint).await.unwrap().unwrap();
        assert_eq!(found.id, camera.id);
        assert_eq!(found.credentials(), Some(creds));
        assert!(found.connected);

        camera.attach_lane("lane-1");
        camera.tuning.fps = Some(5);
        db.update_camera(&camera).await.unwrap();

        let lanes = db.list_cameras(&CameraFilter { lane_attached: Some(true), ..Default::default() }, Page::all()).await.unwrap();
        assert_eq!(lanes.len(), 1);
        assert_eq!(lanes[0].attachment(), Attachment::Lane("lane-1".into()));
        assert_eq!(lanes[0].tuning.fps, Some(5));

        let disconnected = db.list_cameras(&CameraFilter { connected: Some(false), ..Default::default() }, Page::all()).await.unwrap();
        assert!(disconnected.is_empty());

        db.delete_camera(camera.id).await.unwrap();
        assert!(db.find_camera(camera.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lane_and_kiosk_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let mut camera = Camera::new(&CameraEndpoint::new("10.0.0.2", 80), None, None);
        camera.id = db.create_camera(&camera).await.unwrap();

        camera.attach_lane("lane-2");
        camera.attach_kiosk(7);
        assert_eq!(camera.attachment(), Attachment::Kiosk(7));
        assert!(camera.lane_name.is_none());

        camera.lane_name = Some("lane-2".into());
        assert!(db.update_camera(&camera).await.is_err());
    }

    #[tokio::test]
    async fn test_client_delete_cascades_videos() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let mut client = Client {
            id: 0,
            face_id: "face-1".into(),
            camera_id: 1,
            is_on_lane: true,
            directory: "/tmp/face-1".into(),
            created_at: Utc::now(),
            removed_at: None,
        };
        client.id = db.create_client(&client).await.unwrap();

        let video = Video {
            id: 0,
            client_id: client.id,
            camera_id: 1,
            kind: VideoKind::Clip,
            path: "/tmp/face-1/clips/0.mp4".into(),
            start_secs: 1.0,
            end_secs: 4.0,
            sellable: true,
            metadata: None,
            created_at: Utc::now(),
        };
        db.create_video(&video).await.unwrap();
        assert_eq!(db.list_videos_for_client(client.id).await.unwrap().len(), 1);

        client.is_on_lane = false;
        db.update_client(&client).await.unwrap();
        let on_lane = db.list_clients(&ClientFilter { is_on_lane: Some(true), ..Default::default() }, Page::all()).await.unwrap();
        assert!(on_lane.is_empty());

        db.delete_client(client.id).await.unwrap();
        assert!(db.find_client_by_face_id("face-1").await.unwrap().is_none());
        assert!(db.list_videos_for_client(client.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_config_insert_if_missing() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let entry = ConfigEntry { key: "probe.interval".into(), value: "30s".into(), must_reboot: false };
        assert!(db.insert_config_if_missing(&entry).await.unwrap());

        let changed = ConfigEntry { value: "60s".into(), ..entry.clone() };
        assert!(!db.insert_config_if_missing(&changed).await.unwrap());
        assert_eq!(db.get_config("probe.interval").await.unwrap(), Some(entry));

        db.set_config(&changed).await.unwrap();
        assert_eq!(db.get_config("probe.interval").await.unwrap().unwrap().value, "60s");
    }
}
