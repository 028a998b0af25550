use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clients;
use crate::config::{CameraTuning, FfmpegConfig};
use crate::database::{Camera, Client, DatabaseProvider};
use crate::detection::{self, DetectionParams, WorkerHandle, WorkerKind, WorkerMessage, WorkerSpec};
use crate::errors::{EdgeError, Result};
use crate::recording::{ActiveRecording, RecordingManager};
use crate::vision::FaceDetector;

/// Lane session between confirmation and departure
#[derive(Debug, Clone)]
pub struct LaneSession {
    pub client: Client,
    pub faces_dir: PathBuf,
}

struct ActiveStream {
    mode: WorkerKind,
    stream_uri: String,
    tuning: CameraTuning,
    lane_name: Option<String>,
    worker: Option<WorkerHandle>,
    session: Option<LaneSession>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub camera_id: i64,
    pub mode: String,
    pub recording: bool,
    pub in_session: bool,
}

/// What is left of a lane session after it ended
pub enum SessionOutcome {
    /// Enough faces: slice the recording and train the matcher
    Keep {
        session: LaneSession,
        recording: Option<ActiveRecording>,
    },
    /// Not enough faces: the recording is already aborted, the client must go
    Discard { session: LaneSession },
}

/// Owns the per-camera stream mode, its detection worker and its recorder.
///
/// A camera is idle, lane-streaming or kiosk-streaming. Every start tears
/// down whatever ran before.
pub struct StreamOrchestrator {
    database: Arc<dyn DatabaseProvider>,
    detector: Arc<dyn FaceDetector>,
    ffmpeg: FfmpegConfig,
    media_root: PathBuf,
    kill_grace: Duration,
    worker_tx: mpsc::Sender<WorkerMessage>,
    recordings: RecordingManager,
    streams: HashMap<i64, ActiveStream>,
    next_generation: u64,
}

impl StreamOrchestrator {
    pub fn new(
        database: Arc<dyn DatabaseProvider>,
        detector: Arc<dyn FaceDetector>,
        ffmpeg: FfmpegConfig,
        media_root: PathBuf,
        worker_tx: mpsc::Sender<WorkerMessage>,
    ) -> Self {
        Self {
            database,
            detector,
            recordings: RecordingManager::new(ffmpeg.clone()),
            ffmpeg,
            media_root,
            kill_grace: Duration::from_secs(2),
            worker_tx,
            streams: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn set_kill_grace(&mut self, grace: Duration) {
        self.kill_grace = grace;
    }

    pub async fn start_lane_stream(&mut self, camera: &mut Camera, params: Option<DetectionParams>) -> Result<Option<Client>> {
        self.start_stream(camera, WorkerKind::Lane, params).await
    }

    pub async fn start_kiosk_stream(&mut self, camera: &mut Camera, params: Option<DetectionParams>) -> Result<Option<Client>> {
        self.start_stream(camera, WorkerKind::Kiosk, params).await
    }

    /// Returns the client of a lane session that had to be torn down
    async fn start_stream(&mut self, camera: &mut Camera, mode: WorkerKind, params: Option<DetectionParams>) -> Result<Option<Client>> {
        let removed = self.destroy_stream(camera.id).await?;

        let stream_uri = camera.stream_uri.clone()
            .ok_or_else(|| EdgeError::device(format!("camera {} has no stream URI", camera.id)))?;
        camera.streaming = true;
        self.database.update_camera(camera).await?;

        let mut stream = ActiveStream {
            mode,
            stream_uri,
            tuning: camera.tuning.clone(),
            lane_name: camera.lane_name.clone(),
            worker: None,
            session: None,
        };
        match params {
            Some(params) => stream.worker = Some(self.spawn_worker(camera.id, &stream, params, Duration::ZERO)),
            None => warn!("Detection is not configured, camera {} streams without a worker", camera.id),
        }
        info!("Camera {} is now {} streaming", camera.id, mode);
        self.streams.insert(camera.id, stream);
        Ok(removed)
    }

    fn spawn_worker(&mut self, camera_id: i64, stream: &ActiveStream, params: DetectionParams, start_delay: Duration) -> WorkerHandle {
        let generation = self.next_generation;
        self.next_generation += 1;
        let spec = WorkerSpec {
            camera_id,
            kind: stream.mode,
            generation,
            stream_uri: stream.stream_uri.clone(),
            tuning: stream.tuning.clone(),
            media_root: self.media_root.clone(),
            params,
            start_delay,
        };
        detection::spawn_worker(spec, Arc::clone(&self.detector), self.ffmpeg.clone(), self.worker_tx.clone())
    }

    /// Stops detection, then the recorder, then removes a still-active
    /// client. Returns that client; no-op for an idle camera.
    pub async fn destroy_stream(&mut self, camera_id: i64) -> Result<Option<Client>> {
        let Some(mut stream) = self.streams.remove(&camera_id) else {
            return Ok(None);
        };

        if let Some(worker) = stream.worker.take() {
            worker.kill(self.kill_grace);
        }
        self.recordings.abort_recording(camera_id);

        let removed = match stream.session.take() {
            Some(session) => {
                info!("Camera {} torn down mid-session, dropping client {}", camera_id, session.client.id);
                if let Err(e) = clients::remove_client(&*self.database, &session.client).await {
                    error!("Failed to remove client {}: {}", session.client.id, e);
                }
                Some(session.client)
            }
            None => None,
        };

        match self.database.find_camera(camera_id).await? {
            Some(mut camera) => {
                camera.streaming = false;
                self.database.update_camera(&camera).await?;
            }
            None => debug!("Camera {} no longer persisted", camera_id),
        }
        info!("Stopped {} stream on camera {}", stream.mode, camera_id);
        Ok(removed)
    }

    /// True when `generation` is the live worker of `camera_id`
    pub fn is_current(&self, camera_id: i64, generation: u64) -> bool {
        self.streams.get(&camera_id)
            .and_then(|s| s.worker.as_ref())
            .is_some_and(|w| w.generation == generation)
    }

    pub fn mode(&self, camera_id: i64) -> Option<WorkerKind> {
        self.streams.get(&camera_id).map(|s| s.mode)
    }

    pub fn lane_name(&self, camera_id: i64) -> Option<String> {
        self.streams.get(&camera_id).and_then(|s| s.lane_name.clone())
    }

    pub fn active_cameras(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self) -> Vec<StreamSnapshot> {
        let mut snapshot: Vec<StreamSnapshot> = self.streams.iter()
            .map(|(camera_id, stream)| StreamSnapshot {
                camera_id: *camera_id,
                mode: stream.mode.to_string(),
                recording: self.recordings.is_recording(*camera_id),
                in_session: stream.session.is_some(),
            })
            .collect();
        snapshot.sort_by_key(|s| s.camera_id);
        snapshot
    }

    /// Creates the client of a confirmed lane subject and starts recording.
    /// Directory and record are paired best effort.
    pub async fn begin_session(&mut self, camera_id: i64, face_id: &str, faces_dir: PathBuf) -> Result<Client> {
        let stream = self.streams.get(&camera_id)
            .ok_or_else(|| EdgeError::not_found(format!("stream for camera {}", camera_id)))?;
        if stream.mode != WorkerKind::Lane {
            return Err(EdgeError::invariant(format!("camera {} is not a lane camera", camera_id)));
        }
        let stream_uri = stream.stream_uri.clone();

        let directory = clients::client_dir(&self.media_root, face_id);
        tokio::fs::create_dir_all(&directory).await?;
        let mut client = Client {
            id: 0,
            face_id: face_id.to_string(),
            camera_id,
            is_on_lane: true,
            directory: directory.to_string_lossy().to_string(),
            created_at: Utc::now(),
            removed_at: None,
        };
        client.id = self.database.create_client(&client).await?;

        if let Err(e) = self.recordings.start_recording(camera_id, client.id, &stream_uri, &directory) {
            error!("Camera {} session has no recording: {}", camera_id, e);
        }
        if let Some(stream) = self.streams.get_mut(&camera_id) {
            stream.session = Some(LaneSession { client: client.clone(), faces_dir });
        }
        Ok(client)
    }

    /// Closes the camera's lane session; `None` when none was open.
    /// A kept client is marked as having left the lane.
    pub async fn end_session(&mut self, camera_id: i64, got_faces: bool) -> Option<SessionOutcome> {
        let mut session = self.streams.get_mut(&camera_id)?.session.take()?;
        if got_faces {
            let recording = self.recordings.take_recording(camera_id);
            session.client.is_on_lane = false;
            session.client.removed_at = Some(Utc::now());
            if let Err(e) = self.database.update_client(&session.client).await {
                error!("Failed to record departure of client {}: {}", session.client.id, e);
            }
            Some(SessionOutcome::Keep { session, recording })
        } else {
            self.recordings.abort_recording(camera_id);
            Some(SessionOutcome::Discard { session })
        }
    }

    /// Starts a fresh worker in `watching` on the camera's current stream
    pub fn restart_detection(&mut self, camera_id: i64, params: Option<DetectionParams>, delay: Duration) {
        let Some(mut stream) = self.streams.remove(&camera_id) else {
            return;
        };
        if let Some(worker) = stream.worker.take() {
            worker.kill(self.kill_grace);
        }
        match params {
            Some(params) => {
                let worker = self.spawn_worker(camera_id, &stream, params, delay);
                stream.worker = Some(worker);
            }
            None => warn!("Detection is not configured, camera {} left without a worker", camera_id),
        }
        self.streams.insert(camera_id, stream);
    }

    pub async fn shutdown(&mut self) {
        for camera_id in self.active_cameras() {
            if let Err(e) = self.destroy_stream(camera_id).await {
                warn!("Failed to stop stream on camera {}: {}", camera_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{CameraEndpoint, SqliteDatabase};
    use crate::kiosk::KioskParams;
    use crate::lane::LaneParams;
    use crate::vision::{DetectOptions, FaceRect};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct NoFaces;

    #[async_trait]
    impl FaceDetector for NoFaces {
        async fn detect(&self, _jpeg: &Bytes, _options: &DetectOptions) -> Result<Vec<FaceRect>> {
            Ok(Vec::new())
        }
    }

    fn params() -> DetectionParams {
        DetectionParams {
            classifier: "haar".into(),
            fps: 5,
            min_face_size: 40,
            scale_factor: 1.1,
            confirm_timeout: Duration::from_secs(1),
            crash_restart_delay: Duration::from_millis(200),
            lane: LaneParams::default(),
            kiosk: KioskParams::default(),
        }
    }

    async fn setup(dir: &tempfile::TempDir) -> (StreamOrchestrator, Arc<SqliteDatabase>, Camera, mpsc::Receiver<WorkerMessage>) {
        let db = Arc::new(SqliteDatabase::new(dir.path().join("o.db").to_str().unwrap()).await.unwrap());
        db.initialize().await.unwrap();

        let mut camera = Camera::new(&CameraEndpoint::new("10.0.0.8", 80), None, Some("rtsp://10.0.0.8/main".into()));
        camera.attach_lane("lane-1");
        camera.id = db.create_camera(&camera).await.unwrap();

        let ffmpeg = FfmpegConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".into(),
            ..FfmpegConfig::default()
        };
        let (tx, rx) = mpsc::channel(16);
        let orchestrator = StreamOrchestrator::new(
            db.clone(), Arc::new(NoFaces), ffmpeg, dir.path().join("media"), tx,
        );
        (orchestrator, db, camera, rx)
    }

    #[tokio::test]
    async fn test_one_mode_per_camera() {
        let dir = tempfile::tempdir().unwrap();
        let (mut orchestrator, db, mut camera, _rx) = setup(&dir).await;

        orchestrator.start_lane_stream(&mut camera, Some(params())).await.unwrap();
        assert_eq!(orchestrator.mode(camera.id), Some(WorkerKind::Lane));
        assert!(db.find_camera(camera.id).await.unwrap().unwrap().streaming);

        orchestrator.start_kiosk_stream(&mut camera, Some(params())).await.unwrap();
        assert_eq!(orchestrator.mode(camera.id), Some(WorkerKind::Kiosk));
        assert_eq!(orchestrator.active_cameras(), vec![camera.id]);
        assert!(db.find_camera(camera.id).await.unwrap().unwrap().streaming);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (mut orchestrator, db, mut camera, _rx) = setup(&dir).await;

        assert!(orchestrator.destroy_stream(camera.id).await.unwrap().is_none());
        orchestrator.start_lane_stream(&mut camera, None).await.unwrap();

        assert!(orchestrator.destroy_stream(camera.id).await.unwrap().is_none());
        assert!(orchestrator.destroy_stream(camera.id).await.unwrap().is_none());
        assert!(orchestrator.mode(camera.id).is_none());
        assert!(!db.find_camera(camera.id).await.unwrap().unwrap().streaming);
    }

    #[tokio::test]
    async fn test_destroy_mid_session_removes_client() {
        let dir = tempfile::tempdir().unwrap();
        let (mut orchestrator, db, mut camera, _rx) = setup(&dir).await;
        orchestrator.start_lane_stream(&mut camera, None).await.unwrap();

        let client = orchestrator.begin_session(camera.id, "face-1", dir.path().join("faces")).await.unwrap();
        assert!(db.find_client(client.id).await.unwrap().is_some());

        let removed = orchestrator.destroy_stream(camera.id).await.unwrap().unwrap();
        assert_eq!(removed.id, client.id);
        assert!(db.find_client(client.id).await.unwrap().is_none());
        assert!(!std::path::Path::new(&client.directory).exists());
    }

    #[tokio::test]
    async fn test_session_end_without_faces_discards() {
        let dir = tempfile::tempdir().unwrap();
        let (mut orchestrator, _db, mut camera, _rx) = setup(&dir).await;
        orchestrator.start_lane_stream(&mut camera, None).await.unwrap();
        orchestrator.begin_session(camera.id, "face-2", dir.path().join("faces")).await.unwrap();

        assert!(matches!(orchestrator.end_session(camera.id, false).await, Some(SessionOutcome::Discard { .. })));
        assert!(orchestrator.end_session(camera.id, false).await.is_none());
        assert_eq!(orchestrator.mode(camera.id), Some(WorkerKind::Lane));
    }

    #[tokio::test]
    async fn test_kept_session_marks_client_departed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut orchestrator, db, mut camera, _rx) = setup(&dir).await;
        orchestrator.start_lane_stream(&mut camera, None).await.unwrap();
        let client = orchestrator.begin_session(camera.id, "face-3", dir.path().join("faces")).await.unwrap();
        assert!(client.is_on_lane);

        let Some(SessionOutcome::Keep { session, .. }) = orchestrator.end_session(camera.id, true).await else {
            panic!("session with faces should be kept");
        };
        assert!(!session.client.is_on_lane);
        assert!(session.client.removed_at.is_some());

        let stored = db.find_client(client.id).await.unwrap().unwrap();
        assert!(!stored.is_on_lane);
        assert!(stored.removed_at.is_some());
    }

    #[tokio::test]
    async fn test_stale_generation_is_not_current() {
        let dir = tempfile::tempdir().unwrap();
        let (mut orchestrator, _db, mut camera, _rx) = setup(&dir).await;
        orchestrator.start_lane_stream(&mut camera, Some(params())).await.unwrap();
        assert!(orchestrator.is_current(camera.id, 1));

        orchestrator.restart_detection(camera.id, Some(params()), Duration::ZERO);
        assert!(!orchestrator.is_current(camera.id, 1));
        assert!(orchestrator.is_current(camera.id, 2));
    }
}
