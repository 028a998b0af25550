use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::aggregator::RecognitionAggregator;
use crate::clients;
use crate::config::{Config, Credentials, FfmpegConfig};
use crate::config_store::ConfigStore;
use crate::connection_manager::{self, ConnectionManager, PoolReport, TopologyChange};
use crate::database::{Attachment, Camera, CameraEndpoint, CameraFilter, Client, DatabaseProvider, Page};
use crate::detection::{DetectionParams, WorkerKind, WorkerMessage};
use crate::errors::{EdgeError, Result};
use crate::events::{EdgeEvent, EventBus};
use crate::gateway::VideoGateway;
use crate::matcher_pool::{MatchOutcome, MatcherPool};
use crate::mqtt::{AdminCommand, EdgeStatus, MqttHandle, StreamStatus};
use crate::onvif::DeviceConnector;
use crate::orchestrator::{LaneSession, SessionOutcome, StreamOrchestrator, StreamSnapshot};
use crate::prober::{CameraCandidate, DeviceProber};
use crate::recognition::{self, RecognitionPlan};
use crate::recording::{self, ActiveRecording, FinalizeContext, FinalizedRecording};
use crate::vision::{FaceDetector, FaceEmbedder};

/// Administrative requests served by the coordinator task
pub enum Command {
    AttachLane { camera_id: i64, lane_name: String, reply: oneshot::Sender<Result<()>> },
    AttachKiosk { camera_id: i64, kiosk_id: i64, reply: oneshot::Sender<Result<()>> },
    Detach { camera_id: i64, reply: oneshot::Sender<Result<()>> },
    DeleteClient { client_id: i64, reply: oneshot::Sender<Result<()>> },
    SetConfig { key: String, value: String, reply: oneshot::Sender<Result<()>> },
    ProbeNow { reply: oneshot::Sender<bool> },
    Snapshot { reply: oneshot::Sender<Snapshot> },
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub connected: Vec<CameraEndpoint>,
    pub detected: usize,
    pub streams: Vec<StreamSnapshot>,
    pub pending_recognitions: usize,
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await
            .map_err(|_| EdgeError::worker("coordinator is not running"))?;
        rx.await.map_err(|_| EdgeError::worker("coordinator dropped the request"))
    }

    pub async fn attach_lane(&self, camera_id: i64, lane_name: impl Into<String>) -> Result<()> {
        let lane_name = lane_name.into();
        self.request(|reply| Command::AttachLane { camera_id, lane_name, reply }).await?
    }

    pub async fn attach_kiosk(&self, camera_id: i64, kiosk_id: i64) -> Result<()> {
        self.request(|reply| Command::AttachKiosk { camera_id, kiosk_id, reply }).await?
    }

    pub async fn detach(&self, camera_id: i64) -> Result<()> {
        self.request(|reply| Command::Detach { camera_id, reply }).await?
    }

    pub async fn delete_client(&self, client_id: i64) -> Result<()> {
        self.request(|reply| Command::DeleteClient { client_id, reply }).await?
    }

    /// Stores a runtime configuration value; most keys are read when next needed
    pub async fn set_config(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        self.request(|reply| Command::SetConfig { key, value, reply }).await?
    }

    /// False when a probe was already running
    pub async fn probe_now(&self) -> Result<bool> {
        self.request(|reply| Command::ProbeNow { reply }).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    /// Runs one remote administrative command and describes the outcome as JSON
    pub async fn execute(&self, command: AdminCommand) -> serde_json::Value {
        let result = match command {
            AdminCommand::AttachLane { camera_id, lane_name } => self.attach_lane(camera_id, lane_name).await.map(|_| json!(null)),
            AdminCommand::AttachKiosk { camera_id, kiosk_id } => self.attach_kiosk(camera_id, kiosk_id).await.map(|_| json!(null)),
            AdminCommand::Detach { camera_id } => self.detach(camera_id).await.map(|_| json!(null)),
            AdminCommand::DeleteClient { client_id } => self.delete_client(client_id).await.map(|_| json!(null)),
            AdminCommand::SetConfig { key, value } => self.set_config(key, value).await.map(|_| json!(null)),
            AdminCommand::Probe => self.probe_now().await.map(|started| json!({ "started": started })),
            AdminCommand::Snapshot => self.snapshot().await.and_then(|snapshot| Ok(serde_json::to_value(snapshot)?)),
        };
        match result {
            Ok(data) => json!({ "ok": true, "data": data }),
            Err(e) => json!({ "ok": false, "error": e.to_string() }),
        }
    }
}

/// Feeds MQTT commands to the coordinator and publishes each outcome
pub async fn serve_commands(handle: CoordinatorHandle, mut commands: mpsc::Receiver<AdminCommand>, replies: MqttHandle) {
    while let Some(command) = commands.recv().await {
        info!("Executing remote command {:?}", command);
        let reply = handle.execute(command).await;
        replies.publish_reply(&reply).await;
    }
}

/// Completions of work the coordinator handed to spawned tasks
enum Internal {
    ProbeFinished(Result<Vec<CameraCandidate>>),
    PoolChecked(PoolReport),
    CamerasReachable(Vec<Camera>),
    RecognitionPlanned { camera_id: i64, plan: Result<RecognitionPlan> },
    PostProcessed { camera_id: i64, client_id: i64, result: Result<Option<FinalizedRecording>> },
}

#[derive(Debug, Clone)]
struct Timers {
    probe: Duration,
    retry: Duration,
    detected_timeout: Duration,
    cleanup: Duration,
    status: Duration,
}

/// Everything the coordinator is built from
pub struct CoordinatorParts {
    pub database: Arc<dyn DatabaseProvider>,
    pub store: ConfigStore,
    pub bus: EventBus,
    pub connector: Arc<dyn DeviceConnector>,
    pub detector: Arc<dyn FaceDetector>,
    pub embedder: Arc<dyn FaceEmbedder>,
    pub gateway: Option<VideoGateway>,
    pub status: Option<MqttHandle>,
}

/// Single task owning the connection maps, the stream map and the
/// recognition aggregator. Every mutation happens inside `run`.
pub struct Coordinator {
    database: Arc<dyn DatabaseProvider>,
    store: ConfigStore,
    bus: EventBus,
    prober: Arc<DeviceProber>,
    gateway: Option<VideoGateway>,
    status: Option<MqttHandle>,
    embedder: Arc<dyn FaceEmbedder>,
    ffmpeg: FfmpegConfig,

    connections: ConnectionManager,
    orchestrator: StreamOrchestrator,
    aggregator: RecognitionAggregator,
    pool: MatcherPool,
    pool_cursor: usize,
    probing: bool,
    pooling: bool,
    pool_again: bool,
    started_at: Instant,
    timers: Timers,

    commands: mpsc::Receiver<Command>,
    worker_rx: mpsc::Receiver<WorkerMessage>,
    match_rx: mpsc::UnboundedReceiver<MatchOutcome>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl Coordinator {
    pub async fn new(config: &Config, parts: CoordinatorParts) -> Result<(Self, CoordinatorHandle)> {
        let store = parts.store;
        let timers = Timers {
            probe: store.get_duration("probe.interval").await.unwrap_or(Duration::from_secs(30)),
            retry: store.get_duration("camera.retry_interval").await.unwrap_or(Duration::from_secs(60)),
            detected_timeout: store.get_duration("probe.detected_timeout").await.unwrap_or(Duration::from_secs(120)),
            cleanup: store.get_duration("clients.cleanup_interval").await.unwrap_or(Duration::from_secs(3600)),
            status: Duration::from_secs(10),
        };
        let workers = store.get_or("recognition.workers", 2usize).await;
        let threshold = store.get_or("recognition.threshold", 0.6f64).await;

        let (worker_tx, worker_rx) = mpsc::channel(256);
        let (match_tx, match_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::channel(32);

        let mut orchestrator = StreamOrchestrator::new(
            Arc::clone(&parts.database),
            parts.detector,
            config.ffmpeg.clone(),
            config.media_root(),
            worker_tx,
        );
        if let Some(grace) = store.get_duration("detection.kill_grace").await {
            orchestrator.set_kill_grace(grace);
        }

        let coordinator = Self {
            database: parts.database,
            bus: parts.bus,
            prober: Arc::new(DeviceProber::new(config.network.clone())),
            gateway: parts.gateway,
            status: parts.status,
            pool: MatcherPool::spawn(workers, Arc::clone(&parts.embedder), match_tx),
            embedder: parts.embedder,
            ffmpeg: config.ffmpeg.clone(),
            connections: ConnectionManager::new(parts.connector, config.credentials.clone()),
            orchestrator,
            aggregator: RecognitionAggregator::new(threshold),
            pool_cursor: 0,
            probing: false,
            pooling: false,
            pool_again: false,
            started_at: Instant::now(),
            timers,
            store,
            commands,
            worker_rx,
            match_rx,
            internal_tx,
            internal_rx,
        };
        Ok((coordinator, CoordinatorHandle { tx: command_tx }))
    }

    pub async fn run(mut self) -> Result<()> {
        self.restore_cameras().await?;

        let mut probe_timer = interval(self.timers.probe);
        let mut retry_timer = interval(self.timers.retry);
        let mut cleanup_timer = interval(self.timers.cleanup);
        let mut status_timer = interval(self.timers.status);
        for timer in [&mut probe_timer, &mut retry_timer, &mut cleanup_timer, &mut status_timer] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // the first tick of an interval fires immediately; retry has nothing to do yet
        retry_timer.tick().await;

        info!("Coordinator running (probe every {:?})", self.timers.probe);
        loop {
            tokio::select! {
                _ = probe_timer.tick() => {
                    self.connections.reap_detected(self.timers.detected_timeout);
                    self.start_probe(false);
                }
                _ = retry_timer.tick() => self.retry_disconnected().await,
                _ = cleanup_timer.tick() => self.start_cleanup().await,
                _ = status_timer.tick() => self.publish_status().await,
                Some(message) = self.worker_rx.recv() => self.handle_worker_message(message).await,
                Some(outcome) = self.match_rx.recv() => self.handle_match(outcome),
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
            }
        }

        info!("Coordinator shutting down");
        self.orchestrator.shutdown().await;
        self.pool.shutdown();
        Ok(())
    }

    /// Persisted cameras are re-detected with their stored credentials so
    /// the first pool pass reconnects them and restarts their streams
    async fn restore_cameras(&mut self) -> Result<()> {
        if let Some(credentials) = self.store.get_json::<Vec<Credentials>>("camera.credentials").await {
            self.connections.set_credentials(credentials);
        }

        let cameras = self.database.list_cameras(&CameraFilter::default(), Page::all()).await?;
        for mut camera in cameras {
            if camera.streaming || camera.connected {
                camera.streaming = false;
                camera.connected = false;
                self.database.update_camera(&camera).await?;
            }
            self.connections.record_known(camera.endpoint(), camera.credentials());
        }
        self.start_pool_pass();
        Ok(())
    }

    /// `full` adds the subnet scan to multicast discovery
    fn start_probe(&mut self, full: bool) {
        if self.probing {
            debug!("Probe still running, skipping this cycle");
            return;
        }
        self.probing = true;
        let prober = Arc::clone(&self.prober);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = if full { prober.discover().await } else { prober.probe().await };
            let _ = tx.send(Internal::ProbeFinished(result));
        });
    }

    async fn retry_disconnected(&mut self) {
        let cameras = match self.connections.disconnected_cameras(&*self.database).await {
            Ok(cameras) if cameras.is_empty() => return,
            Ok(cameras) => cameras,
            Err(e) => {
                warn!("Disconnected camera retry failed: {}", e);
                return;
            }
        };
        let prober = Arc::clone(&self.prober);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let revived = connection_manager::reachable_cameras(&prober, cameras).await;
            if !revived.is_empty() {
                let _ = tx.send(Internal::CamerasReachable(revived));
            }
        });
    }

    /// Liveness checks and handshakes run in a spawned task; only one pass
    /// is in flight and a request made meanwhile queues a single rerun
    fn start_pool_pass(&mut self) {
        if self.pooling {
            self.pool_again = true;
            return;
        }
        self.pooling = true;
        let pass = self.connections.pool_pass();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Internal::PoolChecked(pass.run().await));
        });
    }

    async fn apply_topology(&mut self, change: TopologyChange) {
        match change {
            TopologyChange::Unchanged => {}
            TopologyChange::Added(endpoints) => {
                let added = match self.connections.persist_added(&*self.database, self.gateway.as_ref(), &endpoints).await {
                    Ok(added) => added,
                    Err(e) => {
                        error!("Failed to persist connected cameras: {}", e);
                        return;
                    }
                };
                for added in added {
                    if added.is_new {
                        debug!("Camera {} seen for the first time", added.camera.id);
                    }
                    let camera = added.camera;
                    self.bus.publish(EdgeEvent::CameraAdded { camera_id: camera.id, ip: camera.ip.clone(), port: camera.port });
                    self.auto_start(camera).await;
                }
            }
            TopologyChange::Removed(endpoints) => {
                let removed = match self.connections.persist_removed(&*self.database, &endpoints).await {
                    Ok(removed) => removed,
                    Err(e) => {
                        error!("Failed to persist disconnected cameras: {}", e);
                        return;
                    }
                };
                for camera in removed {
                    self.stop_stream(camera.id, "camera_removed").await;
                    self.bus.publish(EdgeEvent::CameraRemoved { camera_id: camera.id, ip: camera.ip, port: camera.port });
                }
            }
        }
    }

    async fn auto_start(&mut self, mut camera: Camera) {
        let params = DetectionParams::load(&self.store).await;
        let result = match camera.attachment() {
            Attachment::Lane(_) => self.orchestrator.start_lane_stream(&mut camera, params).await,
            Attachment::Kiosk(_) => self.orchestrator.start_kiosk_stream(&mut camera, params).await,
            Attachment::Unattached => return,
        };
        match result {
            Ok(removed) => self.announce_removed(removed, "stream_restarted"),
            Err(e) => warn!("Failed to start stream for camera {}: {}", camera.id, e),
        }
    }

    async fn stop_stream(&mut self, camera_id: i64, reason: &str) {
        match self.orchestrator.destroy_stream(camera_id).await {
            Ok(removed) => self.announce_removed(removed, reason),
            Err(e) => warn!("Failed to stop stream on camera {}: {}", camera_id, e),
        }
    }

    fn announce_removed(&self, client: Option<Client>, reason: &str) {
        if let Some(client) = client {
            self.bus.publish(EdgeEvent::ClientRemoved {
                client_id: client.id,
                face_id: client.face_id,
                reason: reason.to_string(),
            });
        }
    }

    async fn handle_worker_message(&mut self, message: WorkerMessage) {
        let camera_id = message.camera_id();
        if !self.orchestrator.is_current(camera_id, message.generation()) {
            debug!("Ignoring message from replaced worker on camera {}", camera_id);
            return;
        }

        match message {
            WorkerMessage::SessionStart { face_id, faces_dir, .. } => {
                match self.orchestrator.begin_session(camera_id, &face_id, faces_dir).await {
                    Ok(_) => self.bus.publish(EdgeEvent::SessionStart {
                        camera_id,
                        face_id,
                        lane_name: self.orchestrator.lane_name(camera_id),
                    }),
                    Err(e) => error!("Failed to open session {} on camera {}: {}", face_id, camera_id, e),
                }
            }
            WorkerMessage::SessionEnd { face_id, faces, got_faces, .. } => {
                self.bus.publish(EdgeEvent::SessionEnd { camera_id, face_id, faces, got_faces });
                self.close_session(camera_id, got_faces).await;
                let params = DetectionParams::load(&self.store).await;
                self.orchestrator.restart_detection(camera_id, params, Duration::ZERO);
            }
            WorkerMessage::KioskFaces { session_dir, .. } => self.start_recognition(camera_id, session_dir).await,
            WorkerMessage::WorkerExited { .. } => {
                warn!("Detection worker on camera {} died, ending its session", camera_id);
                if self.orchestrator.mode(camera_id) == Some(WorkerKind::Lane) {
                    self.bus.publish(EdgeEvent::SessionEnd { camera_id, face_id: None, faces: 0, got_faces: false });
                    self.close_session(camera_id, false).await;
                }
                let params = DetectionParams::load(&self.store).await;
                let delay = params.as_ref().map_or(Duration::ZERO, |p| p.crash_restart_delay);
                self.orchestrator.restart_detection(camera_id, params, delay);
            }
        }
    }

    /// Hands the ended session to a background task
    async fn close_session(&mut self, camera_id: i64, got_faces: bool) {
        let Some(outcome) = self.orchestrator.end_session(camera_id, got_faces).await else {
            return;
        };
        let database = Arc::clone(&self.database);
        let bus = self.bus.clone();

        match outcome {
            SessionOutcome::Discard { session } => {
                tokio::spawn(async move {
                    if let Err(e) = clients::remove_client(&*database, &session.client).await {
                        error!("Failed to discard client {}: {}", session.client.id, e);
                        return;
                    }
                    bus.publish(EdgeEvent::ClientRemoved {
                        client_id: session.client.id,
                        face_id: session.client.face_id,
                        reason: "not_enough_faces".to_string(),
                    });
                });
            }
            SessionOutcome::Keep { session, recording } => {
                let store = self.store.clone();
                let embedder = Arc::clone(&self.embedder);
                let ffmpeg = self.ffmpeg.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let client_id = session.client.id;
                    let delta = store.get_or("recording.delta", 1.0f64).await;
                    let base_rate = store.get_or("recognition.train_base_rate", 20.0f64).await;
                    let ctx = FinalizeContext { database, ffmpeg, delta };
                    let result = post_process(ctx, &bus, &*embedder, session, recording, base_rate).await;
                    let _ = tx.send(Internal::PostProcessed { camera_id, client_id, result });
                });
            }
        }
    }

    async fn start_recognition(&mut self, camera_id: i64, images_dir: PathBuf) {
        let Some(threshold) = self.store.get_parsed::<f64>("recognition.threshold").await else {
            return;
        };
        self.aggregator.set_threshold(threshold);
        let num_faces = self.store.get_or("recognition.num_faces_to_check", 3usize).await;

        let database = Arc::clone(&self.database);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let plan = recognition::prepare_recognition(&*database, camera_id, &images_dir, num_faces).await;
            let _ = tx.send(Internal::RecognitionPlanned { camera_id, plan });
        });
    }

    fn dispatch_plan(&mut self, plan: RecognitionPlan) {
        if plan.is_empty() {
            debug!("Nothing to compare for camera {}", plan.camera_id);
            return;
        }
        for process in &plan.processes {
            self.aggregator.register(plan.camera_id, process);
        }
        let jobs = plan.jobs.len();
        for job in plan.jobs {
            let (token, client_id) = (job.token, job.client_id);
            if let Err(e) = self.pool.dispatch(&mut self.pool_cursor, job) {
                error!("Failed to dispatch match job: {}", e);
                // the vote still counts so the process completes
                self.handle_match(MatchOutcome { token, client_id, similarity: None });
            }
        }
        debug!("Dispatched {} match jobs for camera {} across {} workers", jobs, plan.camera_id, self.pool.len());
    }

    fn handle_match(&mut self, outcome: MatchOutcome) {
        if let Some(verdict) = self.aggregator.record(&outcome) {
            self.bus.publish(EdgeEvent::Recognized {
                client_id: verdict.client_id,
                face_id: verdict.face_id,
                camera_id: verdict.camera_id,
                similarity: verdict.similarity,
            });
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ProbeFinished(result) => {
                self.probing = false;
                match result {
                    Ok(candidates) => {
                        debug!("Probe found {} candidates", candidates.len());
                        self.connections.record_candidates(&candidates);
                    }
                    Err(e) => warn!("Probe failed: {}", e),
                }
                self.start_pool_pass();
            }
            Internal::PoolChecked(report) => {
                self.pooling = false;
                let change = self.connections.apply_pool(report);
                self.apply_topology(change).await;
                if std::mem::take(&mut self.pool_again) {
                    self.start_pool_pass();
                }
            }
            Internal::CamerasReachable(cameras) => {
                for camera in &cameras {
                    self.connections.revive(camera);
                }
                self.start_probe(true);
            }
            Internal::RecognitionPlanned { camera_id, plan } => match plan {
                Ok(plan) => self.dispatch_plan(plan),
                Err(e) => warn!("Recognition for camera {} could not start: {}", camera_id, e),
            },
            Internal::PostProcessed { camera_id, client_id, result } => match result {
                Ok(Some(recording)) => info!(
                    "Client {} from camera {}: {} clips ready", client_id, camera_id, recording.clip_ids.len()
                ),
                Ok(None) => info!("Client {} from camera {} kept without a recording", client_id, camera_id),
                Err(e) => error!("Post-processing for client {} failed: {}", client_id, e),
            },
        }
    }

    async fn start_cleanup(&mut self) {
        let Some(retention) = self.store.get_duration("clients.retention").await else {
            return;
        };
        let database = Arc::clone(&self.database);
        let bus = self.bus.clone();
        tokio::spawn(async move {
            match clients::cleanup_expired(&*database, retention).await {
                Ok(removed) => {
                    for client in removed {
                        bus.publish(EdgeEvent::ClientRemoved {
                            client_id: client.id,
                            face_id: client.face_id,
                            reason: "expired".to_string(),
                        });
                    }
                }
                Err(e) => warn!("Client cleanup failed: {}", e),
            }
        });
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            connected: self.connections.connected_endpoints(),
            detected: self.connections.detected_count(),
            streams: self.orchestrator.snapshot(),
            pending_recognitions: self.aggregator.pending(),
        }
    }

    async fn publish_status(&self) {
        let Some(status) = &self.status else {
            return;
        };
        let snapshot = self.snapshot();
        let mut streams = Vec::with_capacity(snapshot.streams.len());
        for stream in &snapshot.streams {
            let endpoint = match self.database.find_camera(stream.camera_id).await {
                Ok(Some(camera)) => camera.endpoint().to_string(),
                _ => String::new(),
            };
            streams.push(StreamStatus { camera_id: stream.camera_id, endpoint, mode: stream.mode.clone() });
        }
        status.update_status(EdgeStatus {
            uptime_secs: self.started_at.elapsed().as_secs(),
            connected_cameras: snapshot.connected.iter().map(ToString::to_string).collect(),
            detected_cameras: snapshot.detected,
            streams,
            pending_recognitions: snapshot.pending_recognitions,
        }).await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AttachLane { camera_id, lane_name, reply } => {
                let _ = reply.send(self.attach(camera_id, Attachment::Lane(lane_name)).await);
            }
            Command::AttachKiosk { camera_id, kiosk_id, reply } => {
                let _ = reply.send(self.attach(camera_id, Attachment::Kiosk(kiosk_id)).await);
            }
            Command::Detach { camera_id, reply } => {
                let _ = reply.send(self.attach(camera_id, Attachment::Unattached).await);
            }
            Command::DeleteClient { client_id, reply } => {
                let _ = reply.send(self.delete_client(client_id).await);
            }
            Command::SetConfig { key, value, reply } => {
                let _ = reply.send(self.store.set(&key, value).await);
            }
            Command::ProbeNow { reply } => {
                let started = !self.probing;
                self.start_probe(true);
                let _ = reply.send(started);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    async fn attach(&mut self, camera_id: i64, attachment: Attachment) -> Result<()> {
        let mut camera = self.database.find_camera(camera_id).await?
            .ok_or_else(|| EdgeError::not_found(format!("camera {}", camera_id)))?;

        self.stop_stream(camera_id, "camera_detached").await;
        // destroy_stream may have rewritten the streaming flag
        camera.streaming = false;
        match attachment {
            Attachment::Lane(lane_name) => camera.attach_lane(lane_name),
            Attachment::Kiosk(kiosk_id) => camera.attach_kiosk(kiosk_id),
            Attachment::Unattached => camera.detach(),
        }
        self.database.update_camera(&camera).await?;
        info!("Camera {} attachment is now {:?}", camera_id, camera.attachment());

        if self.connections.is_connected(&camera.endpoint()) {
            self.auto_start(camera).await;
        }
        Ok(())
    }

    async fn delete_client(&mut self, client_id: i64) -> Result<()> {
        let client = self.database.find_client(client_id).await?
            .ok_or_else(|| EdgeError::not_found(format!("client {}", client_id)))?;
        clients::remove_client(&*self.database, &client).await?;
        self.announce_removed(Some(client), "deleted");
        Ok(())
    }
}

/// Slices the recording, announces it, then trains the client's matcher
async fn post_process(
    ctx: FinalizeContext,
    bus: &EventBus,
    embedder: &dyn FaceEmbedder,
    session: LaneSession,
    recording: Option<ActiveRecording>,
    base_rate: f64,
) -> Result<Option<FinalizedRecording>> {
    let finalized = match recording {
        Some(recording) => {
            let finalized = recording::finalize(ctx, recording).await?;
            bus.publish(EdgeEvent::RecordingAdded {
                client_id: finalized.client_id,
                camera_id: finalized.camera_id,
                master_video_id: finalized.master_video_id,
                clip_ids: finalized.clip_ids.clone(),
                shots: finalized.shots.clone(),
            });
            Some(finalized)
        }
        None => None,
    };

    let client = &session.client;
    let client_dir = PathBuf::from(&client.directory);
    if let Err(e) = recognition::train(embedder, client.id, &client.face_id, &client_dir, &session.faces_dir, base_rate).await {
        warn!("Training for client {} failed: {}", client.id, e);
    }
    Ok(finalized)
}
