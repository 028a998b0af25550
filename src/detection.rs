use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::{CameraTuning, FfmpegConfig};
use crate::config_store::ConfigStore;
use crate::errors::{EdgeError, Result};
use crate::frame_source::{Frame, FrameSource};
use crate::kiosk::{KioskAction, KioskMachine, KioskParams};
use crate::lane::{LaneAction, LaneMachine, LaneParams};
use crate::vision::{self, DetectOptions, FaceDetector, FaceRect};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Lane,
    Kiosk,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Lane => write!(f, "lane"),
            WorkerKind::Kiosk => write!(f, "kiosk"),
        }
    }
}

/// Detection tuning read from the runtime store when a worker starts
#[derive(Debug, Clone)]
pub struct DetectionParams {
    pub classifier: String,
    pub fps: u32,
    pub min_face_size: u32,
    pub scale_factor: f32,
    pub confirm_timeout: Duration,
    /// Pause before a crashed worker is replaced
    pub crash_restart_delay: Duration,
    pub lane: LaneParams,
    pub kiosk: KioskParams,
}

impl DetectionParams {
    /// `None` when the classifier is not configured; detection stays off
    pub async fn load(store: &ConfigStore) -> Option<Self> {
        let classifier = store.get("detection.classifier").await?.value;
        let lane_defaults = LaneParams::default();
        let kiosk_defaults = KioskParams::default();

        let min_start_faces = store.get_or("detection.min_start_faces", lane_defaults.min_start_faces).await;
        let max_frames_without_faces = store
            .get_or("detection.max_frames_without_faces", lane_defaults.max_frames_without_faces)
            .await;

        let fps = store.get_or("detection.fps", 5u32).await.max(1);
        let tick = Duration::from_millis(1000 / u64::from(fps));

        Some(Self {
            classifier,
            fps,
            min_face_size: store.get_or("detection.min_face_size", 60u32).await,
            scale_factor: store.get_or("detection.scale_factor", 1.1f32).await,
            confirm_timeout: store.get_duration("detection.confirm_timeout").await
                .unwrap_or(Duration::from_secs(2)),
            crash_restart_delay: store.get_duration("detection.crash_restart_delay").await.unwrap_or(tick),
            lane: LaneParams {
                min_start_faces,
                max_frames_without_faces,
                min_faces: store.get_or("detection.min_faces", lane_defaults.min_faces).await,
                faced_frames_reset: store
                    .get_or("detection.faced_frames_reset", lane_defaults.faced_frames_reset)
                    .await,
            },
            kiosk: KioskParams {
                min_start_faces,
                max_frames_without_faces,
                session_timeout: store.get_duration("detection.session_timeout").await
                    .unwrap_or(kiosk_defaults.session_timeout),
                max_kiosk_faces: store.get_or("detection.max_kiosk_faces", kiosk_defaults.max_kiosk_faces).await,
            },
        })
    }

    fn options(&self, live_model: bool) -> DetectOptions {
        DetectOptions {
            live_model,
            min_face_size: self.min_face_size,
            scale_factor: self.scale_factor,
            classifier: self.classifier.clone(),
        }
    }

    fn tick(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps))
    }
}

/// Messages a worker sends to the coordinator. Each carries the worker's
/// generation so messages from a replaced worker can be told apart.
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    SessionStart {
        camera_id: i64,
        generation: u64,
        face_id: String,
        faces_dir: PathBuf,
    },
    SessionEnd {
        camera_id: i64,
        generation: u64,
        face_id: Option<String>,
        faces: usize,
        got_faces: bool,
    },
    KioskFaces {
        camera_id: i64,
        generation: u64,
        session_dir: PathBuf,
    },
    WorkerExited {
        camera_id: i64,
        generation: u64,
        abnormal: bool,
    },
}

impl WorkerMessage {
    pub fn camera_id(&self) -> i64 {
        match self {
            WorkerMessage::SessionStart { camera_id, .. }
            | WorkerMessage::SessionEnd { camera_id, .. }
            | WorkerMessage::KioskFaces { camera_id, .. }
            | WorkerMessage::WorkerExited { camera_id, .. } => *camera_id,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            WorkerMessage::SessionStart { generation, .. }
            | WorkerMessage::SessionEnd { generation, .. }
            | WorkerMessage::KioskFaces { generation, .. }
            | WorkerMessage::WorkerExited { generation, .. } => *generation,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub camera_id: i64,
    pub kind: WorkerKind,
    pub generation: u64,
    pub stream_uri: String,
    pub tuning: CameraTuning,
    pub media_root: PathBuf,
    pub params: DetectionParams,
    /// Pause before opening the stream, used after a crash
    pub start_delay: Duration,
}

enum WorkerExit {
    /// Lane session finished; the coordinator decides what runs next
    SessionComplete,
    Cancelled,
}

/// Coordinator-side handle of a running detection worker
pub struct WorkerHandle {
    pub camera_id: i64,
    pub generation: u64,
    cancel: watch::Sender<bool>,
    task: AbortHandle,
    supervisor: JoinHandle<()>,
}

impl WorkerHandle {
    /// Asks the worker to stop after its current frame, then force-aborts
    /// it once `grace` has passed
    pub fn kill(self, grace: Duration) {
        let _ = self.cancel.send(true);
        let task = self.task;
        let supervisor = self.supervisor;
        let camera_id = self.camera_id;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !task.is_finished() {
                warn!("Detection worker for camera {} ignored cancellation, aborting", camera_id);
                task.abort();
            }
            supervisor.abort();
        });
    }
}

pub fn spawn_worker(
    spec: WorkerSpec,
    detector: Arc<dyn FaceDetector>,
    ffmpeg: FfmpegConfig,
    tx: mpsc::Sender<WorkerMessage>,
) -> WorkerHandle {
    let (cancel, cancel_rx) = watch::channel(false);
    let camera_id = spec.camera_id;
    let kind = spec.kind;
    let generation = spec.generation;

    let worker = tokio::spawn(run_worker(spec, detector, ffmpeg, tx.clone(), cancel_rx.clone()));
    let task = worker.abort_handle();

    let supervisor = tokio::spawn(async move {
        let abnormal = match worker.await {
            Ok(Ok(WorkerExit::SessionComplete)) | Ok(Ok(WorkerExit::Cancelled)) => false,
            Ok(Err(e)) => {
                error!("Detection worker for camera {} failed: {}", camera_id, e);
                true
            }
            Err(e) if e.is_panic() => {
                error!("Detection worker for camera {} panicked", camera_id);
                true
            }
            Err(_) => false,
        };
        // a cancelled worker was replaced on purpose
        if abnormal && !*cancel_rx.borrow() {
            let _ = tx.send(WorkerMessage::WorkerExited { camera_id, generation, abnormal }).await;
        }
    });

    info!("Started {} detection worker for camera {} (generation {})", kind, camera_id, generation);
    WorkerHandle { camera_id, generation, cancel, task, supervisor }
}

enum Machine {
    Lane { machine: LaneMachine, face_id: Option<String>, faces_dir: Option<PathBuf> },
    Kiosk { machine: KioskMachine, session_dir: Option<PathBuf> },
}

async fn run_worker(
    spec: WorkerSpec,
    detector: Arc<dyn FaceDetector>,
    ffmpeg: FfmpegConfig,
    tx: mpsc::Sender<WorkerMessage>,
    mut cancel: watch::Receiver<bool>,
) -> Result<WorkerExit> {
    if !spec.start_delay.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(spec.start_delay) => {}
            _ = cancel.changed() => return Ok(WorkerExit::Cancelled),
        }
    }

    let params = &spec.params;
    let mut source = FrameSource::spawn(&ffmpeg, spec.camera_id, &spec.stream_uri, &spec.tuning, params.fps)?;
    let tick = params.tick();
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut machine = match spec.kind {
        WorkerKind::Lane => Machine::Lane {
            machine: LaneMachine::new(params.lane.clone()),
            face_id: None,
            faces_dir: None,
        },
        WorkerKind::Kiosk => Machine::Kiosk {
            machine: KioskMachine::new(params.kiosk.clone()),
            session_dir: None,
        },
    };

    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    debug!("Detection worker for camera {} cancelled", spec.camera_id);
                    source.stop().await;
                    return Ok(WorkerExit::Cancelled);
                }
            }
            _ = ticker.tick() => {
                if !source.is_running() {
                    source.stop().await;
                    return Err(EdgeError::worker(format!("decode pipe for camera {} ended", spec.camera_id)));
                }
                let Some(frame) = source.latest() else {
                    continue;
                };
                let faces = match detect(&*detector, &frame, &params.options(false), tick).await {
                    Some(faces) => faces,
                    None => continue,
                };

                let step = match &mut machine {
                    Machine::Lane { machine, face_id, faces_dir } => {
                        lane_step(&spec, &*detector, &tx, machine, face_id, faces_dir, &frame, faces).await?
                    }
                    Machine::Kiosk { machine, session_dir } => {
                        kiosk_step(&spec, &tx, machine, session_dir, &frame, faces).await?
                    }
                };
                if let Some(exit) = step {
                    source.stop().await;
                    return Ok(exit);
                }
            }
        }
    }
}

/// One detection call bounded by `limit`; `None` skips the frame
async fn detect(detector: &dyn FaceDetector, frame: &Frame, options: &DetectOptions, limit: Duration) -> Option<Vec<FaceRect>> {
    match timeout(limit, detector.detect(&frame.jpeg, options)).await {
        Ok(Ok(faces)) => Some(faces),
        Ok(Err(e)) => {
            warn!("Face detection failed on frame {}: {}", frame.seq, e);
            None
        }
        Err(_) => {
            trace!("Face detection on frame {} exceeded {:?}, skipped", frame.seq, limit);
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn lane_step(
    spec: &WorkerSpec,
    detector: &dyn FaceDetector,
    tx: &mpsc::Sender<WorkerMessage>,
    machine: &mut LaneMachine,
    face_id: &mut Option<String>,
    faces_dir: &mut Option<PathBuf>,
    frame: &Frame,
    faces: Vec<FaceRect>,
) -> Result<Option<WorkerExit>> {
    let action = machine.on_frame(faces.len());
    trace!(
        "Camera {} frame {}: {} faces, {:?}, {} collected",
        spec.camera_id, frame.seq, faces.len(), machine.state(), machine.collected_faces()
    );
    match action {
        LaneAction::None | LaneAction::SessionStart => Ok(None),
        LaneAction::Confirm => {
            debug!("Camera {} saw {} faced frames, confirming", spec.camera_id, machine.face_sequence());
            let live = detect(detector, frame, &spec.params.options(true), spec.params.confirm_timeout).await;
            let confirmed = live.as_ref().is_some_and(|f| !f.is_empty());
            if machine.on_confirmation(confirmed) != LaneAction::SessionStart {
                debug!("Camera {} confirmation rejected, back to watching", spec.camera_id);
                return Ok(None);
            }

            let id = uuid::Uuid::new_v4().to_string();
            let dir = spec.media_root.join("clients").join(&id).join("faces");
            tokio::fs::create_dir_all(&dir).await?;
            save_faces(spec.camera_id, &dir, frame, live.as_deref().unwrap_or_default()).await;

            info!("Camera {} session started for face {}", spec.camera_id, id);
            let message = WorkerMessage::SessionStart {
                camera_id: spec.camera_id,
                generation: spec.generation,
                face_id: id.clone(),
                faces_dir: dir.clone(),
            };
            *face_id = Some(id);
            *faces_dir = Some(dir);
            Ok(send(tx, message).await)
        }
        LaneAction::SaveFaces => {
            if let Some(dir) = faces_dir.as_deref() {
                save_faces(spec.camera_id, dir, frame, &faces).await;
            }
            Ok(None)
        }
        LaneAction::SessionEnd { faces, got_faces } => {
            info!("Camera {} session ended with {} faces (kept: {})", spec.camera_id, faces, got_faces);
            let message = WorkerMessage::SessionEnd {
                camera_id: spec.camera_id,
                generation: spec.generation,
                face_id: face_id.take(),
                faces,
                got_faces,
            };
            Ok(send(tx, message).await.or(Some(WorkerExit::SessionComplete)))
        }
    }
}

async fn kiosk_step(
    spec: &WorkerSpec,
    tx: &mpsc::Sender<WorkerMessage>,
    machine: &mut KioskMachine,
    session_dir: &mut Option<PathBuf>,
    frame: &Frame,
    faces: Vec<FaceRect>,
) -> Result<Option<WorkerExit>> {
    let action = machine.on_frame(faces.len(), Instant::now());
    trace!("Kiosk camera {} frame {}: {} faces (present: {})", spec.camera_id, frame.seq, faces.len(), machine.is_present());
    match action {
        KioskAction::None => Ok(None),
        KioskAction::PresenceStart => {
            let session = uuid::Uuid::new_v4().to_string();
            let dir = spec.media_root
                .join("kiosk")
                .join(spec.camera_id.to_string())
                .join(session);
            tokio::fs::create_dir_all(&dir).await?;
            info!("Kiosk camera {} presence confirmed, collecting faces in '{}'", spec.camera_id, dir.display());
            *session_dir = Some(dir);
            Ok(None)
        }
        KioskAction::SaveFaces => {
            if let Some(dir) = session_dir.as_deref() {
                save_faces(spec.camera_id, dir, frame, &faces).await;
            }
            Ok(None)
        }
        KioskAction::FacesReady => {
            let Some(dir) = session_dir.clone() else {
                return Ok(None);
            };
            save_faces(spec.camera_id, &dir, frame, &faces).await;
            let message = WorkerMessage::KioskFaces {
                camera_id: spec.camera_id,
                generation: spec.generation,
                session_dir: dir,
            };
            Ok(send(tx, message).await)
        }
        KioskAction::PresenceEnd(reason) => {
            info!("Kiosk camera {} presence ended ({:?})", spec.camera_id, reason);
            *session_dir = None;
            Ok(None)
        }
    }
}

/// `Some(Cancelled)` once the coordinator is gone
async fn send(tx: &mpsc::Sender<WorkerMessage>, message: WorkerMessage) -> Option<WorkerExit> {
    match tx.send(message).await {
        Ok(()) => None,
        Err(_) => Some(WorkerExit::Cancelled),
    }
}

/// Crops are best effort; a failed crop only loses that face
async fn save_faces(camera_id: i64, dir: &Path, frame: &Frame, faces: &[FaceRect]) {
    for (index, rect) in faces.iter().enumerate() {
        let jpeg = frame.jpeg.clone();
        let rect = *rect;
        let crop = match tokio::task::spawn_blocking(move || vision::crop_face(&jpeg, &rect)).await {
            Ok(Ok(crop)) => crop,
            Ok(Err(e)) => {
                debug!("Camera {} face crop failed: {}", camera_id, e);
                continue;
            }
            Err(e) => {
                warn!("Camera {} face crop task failed: {}", camera_id, e);
                continue;
            }
        };
        let path = dir.join(format!("{:08}_{}.jpg", frame.seq, index));
        if let Err(e) = tokio::fs::write(&path, crop).await {
            warn!("Failed to write face crop '{}': {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteDatabase;

    #[tokio::test]
    async fn test_params_require_classifier() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteDatabase::new(dir.path().join("d.db").to_str().unwrap()).await.unwrap();
        crate::database::DatabaseProvider::initialize(&db).await.unwrap();
        let store = ConfigStore::new(Arc::new(db));

        assert!(DetectionParams::load(&store).await.is_none());

        store.set("detection.classifier", "haar_frontal").await.unwrap();
        store.set("detection.min_start_faces", "12").await.unwrap();
        store.set("detection.session_timeout", "45s").await.unwrap();
        let params = DetectionParams::load(&store).await.unwrap();
        assert_eq!(params.lane.min_start_faces, 12);
        assert_eq!(params.kiosk.min_start_faces, 12);
        assert_eq!(params.kiosk.session_timeout, Duration::from_secs(45));
        assert_eq!(params.tick(), Duration::from_millis(200));
        assert_eq!(params.crash_restart_delay, params.tick());

        store.set("detection.fps", "4").await.unwrap();
        assert_eq!(DetectionParams::load(&store).await.unwrap().crash_restart_delay, Duration::from_millis(250));
        store.set("detection.crash_restart_delay", "1s").await.unwrap();
        assert_eq!(DetectionParams::load(&store).await.unwrap().crash_restart_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_message_accessors() {
        let message = WorkerMessage::WorkerExited { camera_id: 3, generation: 9, abnormal: true };
        assert_eq!(message.camera_id(), 3);
        assert_eq!(message.generation(), 9);
    }

    struct NoFaces;

    #[async_trait::async_trait]
    impl FaceDetector for NoFaces {
        async fn detect(&self, _jpeg: &bytes::Bytes, _options: &DetectOptions) -> Result<Vec<FaceRect>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_failed_decoder_reports_abnormal_exit() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = FfmpegConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".into(),
            ..FfmpegConfig::default()
        };
        let spec = WorkerSpec {
            camera_id: 7,
            kind: WorkerKind::Lane,
            generation: 2,
            stream_uri: "rtsp://127.0.0.1/none".into(),
            tuning: CameraTuning::default(),
            media_root: dir.path().to_path_buf(),
            params: DetectionParams {
                classifier: "haar".into(),
                fps: 5,
                min_face_size: 40,
                scale_factor: 1.1,
                confirm_timeout: Duration::from_secs(1),
                crash_restart_delay: Duration::ZERO,
                lane: LaneParams::default(),
                kiosk: KioskParams::default(),
            },
            start_delay: Duration::ZERO,
        };
        let (tx, mut rx) = mpsc::channel(4);
        let _handle = spawn_worker(spec, Arc::new(NoFaces), ffmpeg, tx);

        match rx.recv().await {
            Some(WorkerMessage::WorkerExited { camera_id, generation, abnormal }) => {
                assert_eq!((camera_id, generation, abnormal), (7, 2, true));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
