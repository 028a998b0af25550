use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::FfmpegConfig;
use crate::database::{DatabaseProvider, Video, VideoKind};
use crate::errors::Result;
use crate::segments::{self, SilenceTracker, VideoSegment};
use crate::transcoder;

pub const RAW_RECORDING: &str = "raw.mp4";

pub struct ActiveRecording {
    pub camera_id: i64,
    pub client_id: i64,
    pub path: PathBuf,
    pub started_at: Instant,
    child: Child,
    silence: JoinHandle<SilenceTracker>,
}

/// Per-camera recorder processes. Owned by the stream orchestrator.
pub struct RecordingManager {
    ffmpeg: FfmpegConfig,
    active_recordings: HashMap<i64, ActiveRecording>,
}

impl RecordingManager {
    pub fn new(ffmpeg: FfmpegConfig) -> Self {
        Self {
            ffmpeg,
            active_recordings: HashMap::new(),
        }
    }

    pub fn start_recording(&mut self, camera_id: i64, client_id: i64, stream_uri: &str, client_dir: &Path) -> Result<()> {
        if self.abort_recording(camera_id) {
            warn!("Camera {} had a recording in progress, aborted before starting a new one", camera_id);
        }

        std::fs::create_dir_all(client_dir)?;
        let path = client_dir.join(RAW_RECORDING);
        let cmd = transcoder::recorder_command(&self.ffmpeg, stream_uri, &path);
        let mut child = transcoder::spawn(&self.ffmpeg, &cmd, true, false)?;

        let stderr = child.stderr.take();
        let log_stderr = self.ffmpeg.log_stderr;
        let silence = tokio::spawn(async move {
            let mut tracker = SilenceTracker::default();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if log_stderr {
                        debug!("[recorder {}] {}", camera_id, line);
                    }
                    tracker.feed_line(&line);
                }
            }
            debug!("Recorder output for camera {} closed", camera_id);
            tracker
        });

        info!("Started recording for camera {} (client {}) at '{}'", camera_id, client_id, path.display());
        self.active_recordings.insert(camera_id, ActiveRecording {
            camera_id,
            client_id,
            path,
            started_at: Instant::now(),
            child,
            silence,
        });
        Ok(())
    }

    /// Detaches the recording for graceful shutdown and post-processing elsewhere
    pub fn take_recording(&mut self, camera_id: i64) -> Option<ActiveRecording> {
        self.active_recordings.remove(&camera_id)
    }

    /// Force-kills the recorder without post-processing
    pub fn abort_recording(&mut self, camera_id: i64) -> bool {
        match self.active_recordings.remove(&camera_id) {
            Some(mut recording) => {
                if let Err(e) = recording.child.start_kill() {
                    debug!("Recorder for camera {} already exited: {}", camera_id, e);
                }
                recording.silence.abort();
                info!("Aborted recording for camera {}", camera_id);
                true
            }
            None => false,
        }
    }

    pub fn is_recording(&self, camera_id: i64) -> bool {
        self.active_recordings.contains_key(&camera_id)
    }
}

#[derive(Clone)]
pub struct FinalizeContext {
    pub database: Arc<dyn DatabaseProvider>,
    pub ffmpeg: FfmpegConfig,
    pub delta: f64,
}

#[derive(Debug, Clone)]
pub struct FinalizedRecording {
    pub camera_id: i64,
    pub client_id: i64,
    pub master_video_id: i64,
    pub clip_ids: Vec<i64>,
    pub shots: Vec<f64>,
}

/// Stops the recorder cleanly and slices the result into sellable media.
///
/// Runs even when the recorder died early, so a truncated file still yields
/// a master video.
pub async fn finalize(ctx: FinalizeContext, mut recording: ActiveRecording) -> Result<FinalizedRecording> {
    let grace = Duration::from_secs(ctx.ffmpeg.stop_grace_secs);
    match transcoder::graceful_stop(&mut recording.child, grace).await {
        Ok(Some(status)) if !status.success() => {
            warn!("Recorder for camera {} exited with {}, using what was written", recording.camera_id, status);
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to stop recorder for camera {}: {}", recording.camera_id, e),
    }

    let tracker = match (&mut recording.silence).await {
        Ok(tracker) => tracker,
        Err(e) => {
            warn!("Silence parser for camera {} failed: {}", recording.camera_id, e);
            SilenceTracker::default()
        }
    };

    let duration = match transcoder::probe_duration(&ctx.ffmpeg, &recording.path).await {
        Ok(duration) => duration,
        Err(e) => {
            let elapsed = recording.started_at.elapsed().as_secs_f64();
            warn!("{}; falling back to wall-clock duration {:.1}s", e, elapsed);
            elapsed
        }
    };

    let silence = tracker.finish(duration);
    let sound = segments::invert_segments(&silence, duration);
    let shots = segments::shot_timestamps(&sound);
    let clips = segments::extend_and_merge_segments(&sound, ctx.delta, duration);
    info!(
        "Camera {} recording: {:.1}s, {} silences, {} shots, {} clips",
        recording.camera_id, duration, silence.len(), shots.len(), clips.len()
    );

    let client_dir = recording.path.parent().map(Path::to_path_buf).unwrap_or_default();

    let master = Video {
        id: 0,
        client_id: recording.client_id,
        camera_id: recording.camera_id,
        kind: VideoKind::Master,
        path: recording.path.to_string_lossy().to_string(),
        start_secs: 0.0,
        end_secs: duration,
        sellable: false,
        metadata: Some(serde_json::json!({ "shots": shots, "sound": sound })),
        created_at: Utc::now(),
    };
    let master_video_id = ctx.database.create_video(&master).await?;

    let photo_dir = client_dir.join("photos");
    tokio::fs::create_dir_all(&photo_dir).await?;
    for (index, shot) in shots.iter().enumerate() {
        let photo_path = photo_dir.join(format!("shot_{:03}.jpg", index));
        let cmd = transcoder::frame_command(&recording.path, *shot, &photo_path);
        if let Err(e) = transcoder::run(&ctx.ffmpeg, &cmd).await {
            warn!("Frame extraction at {:.2}s failed for client {}: {}", shot, recording.client_id, e);
            continue;
        }
        let photo = Video {
            id: 0,
            client_id: recording.client_id,
            camera_id: recording.camera_id,
            kind: VideoKind::Photo,
            path: photo_path.to_string_lossy().to_string(),
            start_secs: *shot,
            end_secs: *shot,
            sellable: true,
            metadata: None,
            created_at: Utc::now(),
        };
        ctx.database.create_video(&photo).await?;
    }

    let clip_dir = client_dir.join("clips");
    tokio::fs::create_dir_all(&clip_dir).await?;
    let mut clip_ids = Vec::with_capacity(clips.len());
    for (index, clip) in clips.iter().enumerate() {
        clip_ids.push(register_and_cut(&ctx, &recording, &clip_dir, index, clip).await?);
    }

    Ok(FinalizedRecording {
        camera_id: recording.camera_id,
        client_id: recording.client_id,
        master_video_id,
        clip_ids,
        shots,
    })
}

/// The clip row exists before its file is final
async fn register_and_cut(
    ctx: &FinalizeContext,
    recording: &ActiveRecording,
    clip_dir: &Path,
    index: usize,
    clip: &VideoSegment,
) -> Result<i64> {
    let clip_path = clip_dir.join(format!("clip_{:03}.mp4", index));
    let video = Video {
        id: 0,
        client_id: recording.client_id,
        camera_id: recording.camera_id,
        kind: VideoKind::Clip,
        path: clip_path.to_string_lossy().to_string(),
        start_secs: clip.start,
        end_secs: clip.end,
        sellable: true,
        metadata: None,
        created_at: Utc::now(),
    };
    let id = ctx.database.create_video(&video).await?;

    let cmd = transcoder::cut_command(&recording.path, clip.start, clip.end, &clip_path);
    if let Err(e) = transcoder::run(&ctx.ffmpeg, &cmd).await {
        error!("Cutting clip {} ({:.2}-{:.2}) for client {} failed: {}",
               id, clip.start, clip.end, recording.client_id, e);
    }
    Ok(id)
}
