//! Matcher training and recognition dispatch planning.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::{ClientFilter, DatabaseProvider, Page};
use crate::errors::{EdgeError, Result};
use crate::vision::FaceEmbedder;

pub const MATCHER_FILE: &str = "matcher.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherFile {
    pub client_id: i64,
    pub face_id: String,
    pub created_at: DateTime<Utc>,
    pub embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct LoadedMatcher {
    pub client_id: i64,
    pub face_id: String,
    pub embeddings: Arc<Vec<Vec<f32>>>,
}

/// Fraction of a session's crops used for training. 1.0 up to `base_rate`
/// images, then shrinking with the log of the image count.
pub fn training_fraction(count: usize, base_rate: f64) -> f64 {
    let base_rate = base_rate.max(1.0);
    let ratio = count as f64 / base_rate;
    if ratio <= 1.0 {
        return 1.0;
    }
    1.0 / (1.0 + ratio.ln())
}

/// `count` items spread evenly over `items`, keeping order
pub fn downsample<T: Clone>(items: &[T], count: usize) -> Vec<T> {
    if count == 0 || items.is_empty() {
        return Vec::new();
    }
    if count >= items.len() {
        return items.to_vec();
    }
    let step = items.len() as f64 / count as f64;
    (0..count)
        .map(|i| items[(i as f64 * step) as usize].clone())
        .collect()
}

pub fn select_training_images(images: &[PathBuf], base_rate: f64) -> Vec<PathBuf> {
    let keep = (images.len() as f64 * training_fraction(images.len(), base_rate)).ceil() as usize;
    downsample(images, keep)
}

pub async fn list_face_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_jpeg = path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"));
        if is_jpeg {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Builds the client's matcher from its session crops and writes it next to
/// the client's media. Returns the number of embeddings stored.
pub async fn train(
    embedder: &dyn FaceEmbedder,
    client_id: i64,
    face_id: &str,
    client_dir: &Path,
    faces_dir: &Path,
    base_rate: f64,
) -> Result<usize> {
    let images = list_face_images(faces_dir).await?;
    let selected = select_training_images(&images, base_rate);
    debug!("Training client {} on {} of {} crops", client_id, selected.len(), images.len());

    let mut embeddings = Vec::with_capacity(selected.len());
    for path in &selected {
        let jpeg = Bytes::from(tokio::fs::read(path).await?);
        match embedder.embed(&jpeg).await {
            Ok(Some(embedding)) => embeddings.push(embedding),
            Ok(None) => debug!("No face in training crop '{}'", path.display()),
            Err(e) => warn!("Embedding '{}' failed: {}", path.display(), e),
        }
    }
    if embeddings.is_empty() {
        return Err(EdgeError::vision(format!("no usable face among {} crops of client {}", selected.len(), client_id)));
    }

    let matcher = MatcherFile {
        client_id,
        face_id: face_id.to_string(),
        created_at: Utc::now(),
        embeddings,
    };
    let count = matcher.embeddings.len();
    let target = client_dir.join(MATCHER_FILE);
    let staging = client_dir.join(format!("{}.tmp", MATCHER_FILE));
    tokio::fs::write(&staging, serde_json::to_vec(&matcher)?).await?;
    tokio::fs::rename(&staging, &target).await?;

    info!("Trained matcher for client {} with {} embeddings", client_id, count);
    Ok(count)
}

/// Every trained matcher, most recently created client first
pub async fn load_matchers(database: &dyn DatabaseProvider) -> Result<Vec<LoadedMatcher>> {
    let clients = database.list_clients(&ClientFilter::default(), Page::all()).await?;
    let mut matchers = Vec::new();
    for client in clients {
        let path = Path::new(&client.directory).join(MATCHER_FILE);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!("Failed to read matcher '{}': {}", path.display(), e);
                continue;
            }
        };
        match serde_json::from_slice::<MatcherFile>(&content) {
            Ok(file) if !file.embeddings.is_empty() => matchers.push(LoadedMatcher {
                client_id: client.id,
                face_id: client.face_id.clone(),
                embeddings: Arc::new(file.embeddings),
            }),
            Ok(_) => debug!("Matcher for client {} is empty", client.id),
            Err(e) => warn!("Corrupt matcher '{}': {}", path.display(), e),
        }
    }
    Ok(matchers)
}

/// One face image compared against one matcher
#[derive(Debug, Clone)]
pub struct MatchJob {
    pub token: Uuid,
    pub client_id: i64,
    pub image: PathBuf,
    pub matcher: Arc<Vec<Vec<f32>>>,
}

/// A (matcher, invocation) pair awaiting `expected` results
#[derive(Debug, Clone)]
pub struct PlannedProcess {
    pub token: Uuid,
    pub client_id: i64,
    pub face_id: String,
    pub expected: usize,
}

#[derive(Debug, Clone)]
pub struct RecognitionPlan {
    pub camera_id: i64,
    pub processes: Vec<PlannedProcess>,
    pub jobs: Vec<MatchJob>,
}

impl RecognitionPlan {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

pub fn plan_recognition(camera_id: i64, matchers: &[LoadedMatcher], images: &[PathBuf], num_faces: usize) -> RecognitionPlan {
    let sampled = downsample(images, num_faces);
    let mut processes = Vec::new();
    let mut jobs = Vec::new();
    if sampled.is_empty() {
        return RecognitionPlan { camera_id, processes, jobs };
    }

    for matcher in matchers {
        let token = Uuid::new_v4();
        processes.push(PlannedProcess {
            token,
            client_id: matcher.client_id,
            face_id: matcher.face_id.clone(),
            expected: sampled.len(),
        });
        jobs.extend(sampled.iter().map(|image| MatchJob {
            token,
            client_id: matcher.client_id,
            image: image.clone(),
            matcher: Arc::clone(&matcher.embeddings),
        }));
    }
    RecognitionPlan { camera_id, processes, jobs }
}

/// Loads matchers and crops for one kiosk presence and plans the comparisons
pub async fn prepare_recognition(
    database: &dyn DatabaseProvider,
    camera_id: i64,
    images_dir: &Path,
    num_faces: usize,
) -> Result<RecognitionPlan> {
    let images = list_face_images(images_dir).await?;
    let matchers = load_matchers(database).await?;
    let plan = plan_recognition(camera_id, &matchers, &images, num_faces);
    debug!(
        "Recognition for camera {}: {} crops, {} matchers, {} jobs",
        camera_id, images.len(), matchers.len(), plan.jobs.len()
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Client, SqliteDatabase};
    use async_trait::async_trait;

    #[test]
    fn test_training_fraction_shrinks() {
        assert_eq!(training_fraction(5, 20.0), 1.0);
        assert_eq!(training_fraction(20, 20.0), 1.0);

        let mut previous_fraction = 1.0;
        let mut previous_kept = 20.0;
        for count in [40usize, 100, 400, 2000] {
            let fraction = training_fraction(count, 20.0);
            let kept = count as f64 * fraction;
            assert!(fraction < previous_fraction);
            // still more images overall, just proportionally fewer
            assert!(kept > previous_kept);
            previous_fraction = fraction;
            previous_kept = kept;
        }
    }

    #[test]
    fn test_downsample_spreads_evenly() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(downsample(&items, 3), vec![0, 3, 6]);
        assert_eq!(downsample(&items, 20), items);
        assert!(downsample(&items, 0).is_empty());
    }

    #[test]
    fn test_plan_tags_each_matcher_once() {
        let matchers = vec![
            LoadedMatcher { client_id: 2, face_id: "b".into(), embeddings: Arc::new(vec![vec![1.0]]) },
            LoadedMatcher { client_id: 1, face_id: "a".into(), embeddings: Arc::new(vec![vec![0.5]]) },
        ];
        let images: Vec<PathBuf> = (0..6).map(|i| PathBuf::from(format!("{}.jpg", i))).collect();
        let plan = plan_recognition(4, &matchers, &images, 3);

        assert_eq!(plan.processes.len(), 2);
        assert_eq!(plan.jobs.len(), 6);
        assert_ne!(plan.processes[0].token, plan.processes[1].token);
        for process in &plan.processes {
            let jobs = plan.jobs.iter().filter(|j| j.token == process.token).count();
            assert_eq!(jobs, process.expected);
        }
        assert_eq!(plan.jobs[0].client_id, 2);
    }

    struct FixedEmbedder;

    #[async_trait]
    impl FaceEmbedder for FixedEmbedder {
        async fn embed(&self, jpeg: &Bytes) -> Result<Option<Vec<f32>>> {
            if jpeg.is_empty() {
                return Ok(None);
            }
            Ok(Some(vec![jpeg[0] as f32, 1.0]))
        }
    }

    #[tokio::test]
    async fn test_train_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteDatabase::new(dir.path().join("r.db").to_str().unwrap()).await.unwrap();
        db.initialize().await.unwrap();

        let client_dir = dir.path().join("clients").join("face-a");
        let faces_dir = client_dir.join("faces");
        tokio::fs::create_dir_all(&faces_dir).await.unwrap();
        tokio::fs::write(faces_dir.join("0001_0.jpg"), [3u8, 1]).await.unwrap();
        tokio::fs::write(faces_dir.join("0002_0.jpg"), b"").await.unwrap();
        tokio::fs::write(faces_dir.join("notes.txt"), "x").await.unwrap();

        let client_id = db.create_client(&Client {
            id: 0,
            face_id: "face-a".into(),
            camera_id: 1,
            is_on_lane: true,
            directory: client_dir.to_string_lossy().to_string(),
            created_at: Utc::now(),
            removed_at: None,
        }).await.unwrap();

        let stored = train(&FixedEmbedder, client_id, "face-a", &client_dir, &faces_dir, 20.0).await.unwrap();
        assert_eq!(stored, 1);

        let matchers = load_matchers(&db).await.unwrap();
        assert_eq!(matchers.len(), 1);
        assert_eq!(matchers[0].client_id, client_id);
        assert_eq!(*matchers[0].embeddings, vec![vec![3.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_train_without_faces_fails() {
        let dir = tempfile::tempdir().unwrap();
        let faces_dir = dir.path().join("faces");
        tokio::fs::create_dir_all(&faces_dir).await.unwrap();
        tokio::fs::write(faces_dir.join("a.jpg"), b"").await.unwrap();

        assert!(train(&FixedEmbedder, 1, "f", dir.path(), &faces_dir, 20.0).await.is_err());
        assert!(!dir.path().join(MATCHER_FILE).exists());
    }
}
