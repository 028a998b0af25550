use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::{CameraTuning, FfmpegConfig};
use crate::errors::{EdgeError, Result};

/// Builder for one ffmpeg invocation
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: String,
    output: String,
    input_args: Vec<String>,
    output_args: Vec<String>,
    /// Additional outputs appended after the primary one, each with its own options
    extra_outputs: Vec<String>,
    overwrite: bool,
    log_level: String,
}

impl FfmpegCommand {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            extra_outputs: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn extra_output<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_outputs.extend(args.into_iter().map(Into::into));
        self
    }

    /// Fast keyframe seek on the input side
    pub fn seek(self, seconds: f64) -> Self {
        self.input_arg("-ss").input_arg(format!("{:.3}", seconds))
    }

    /// Frame-accurate seek on the output side (decodes up to the timestamp)
    pub fn output_seek(self, seconds: f64) -> Self {
        self.output_arg("-ss").output_arg(format!("{:.3}", seconds))
    }

    pub fn duration(self, seconds: f64) -> Self {
        self.output_arg("-t").output_arg(format!("{:.3}", seconds))
    }

    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    pub fn stream_copy(self) -> Self {
        self.output_arg("-c").output_arg("copy")
    }

    pub fn single_frame(self) -> Self {
        self.output_arg("-frames:v").output_arg("1")
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }
        args.push("-hide_banner".to_string());
        args.push("-loglevel".to_string());
        args.push(self.log_level.clone());

        args.extend(self.input_args.clone());
        args.push("-i".to_string());
        args.push(self.input.clone());

        args.extend(self.output_args.clone());
        args.push(self.output.clone());

        args.extend(self.extra_outputs.clone());
        args
    }
}

/// crop, scale, rotation and sampling rate for the detection pipe, in that order
pub fn build_video_filter(tuning: &CameraTuning, fps: u32) -> String {
    let mut filters = Vec::new();

    if let Some(crop) = &tuning.crop {
        filters.push(format!("crop={}:{}:{}:{}", crop.width, crop.height, crop.x, crop.y));
    }

    if let Some(width) = tuning.target_width {
        filters.push(format!("scale={}:-2", width));
    } else if let Some(scale) = tuning.scale.filter(|s| (*s - 1.0).abs() > f32::EPSILON) {
        filters.push(format!("scale=trunc(iw*{}/2)*2:-2", scale));
    }

    match tuning.rotation {
        90 => filters.push("transpose=1".to_string()),
        180 => filters.push("transpose=1,transpose=1".to_string()),
        270 => filters.push("transpose=2".to_string()),
        _ => {}
    }

    filters.push(format!("fps={}", tuning.fps.unwrap_or(fps).max(1)));
    filters.join(",")
}

pub fn decode_pipe_command(ffmpeg: &FfmpegConfig, stream_uri: &str, tuning: &CameraTuning, fps: u32) -> FfmpegCommand {
    FfmpegCommand::new(stream_uri, "pipe:1")
        .input_arg("-rtsp_transport").input_arg(&ffmpeg.rtsp_transport)
        .input_arg("-fflags").input_arg("+nobuffer+discardcorrupt")
        .input_arg("-flags").input_arg("low_delay")
        .video_filter(build_video_filter(tuning, fps))
        .output_arg("-an")
        .output_arg("-f").output_arg("image2pipe")
        .output_arg("-vcodec").output_arg("mjpeg")
        .output_arg("-q:v").output_arg("5")
}

/// Stream-copies video into the container while a second output runs
/// silencedetect over the audio; its findings arrive on stderr at info level
pub fn recorder_command(ffmpeg: &FfmpegConfig, stream_uri: &str, output: &Path) -> FfmpegCommand {
    FfmpegCommand::new(stream_uri, output.to_string_lossy())
        .log_level("info")
        .input_arg("-rtsp_transport").input_arg(&ffmpeg.rtsp_transport)
        .output_arg("-map").output_arg("0:v:0")
        .output_arg("-map").output_arg("0:a:0?")
        .output_arg("-c:v").output_arg("copy")
        .output_arg("-c:a").output_arg("aac")
        .output_arg("-movflags").output_arg("+faststart")
        .extra_output([
            "-map".to_string(),
            "0:a:0?".to_string(),
            "-af".to_string(),
            format!("silencedetect=noise={}:d={}", ffmpeg.silence_noise, ffmpeg.silence_min_duration),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ])
}

pub fn cut_command(master: &Path, start: f64, end: f64, output: &Path) -> FfmpegCommand {
    FfmpegCommand::new(master.to_string_lossy(), output.to_string_lossy())
        .seek(start)
        .duration((end - start).max(0.0))
        .stream_copy()
        .output_arg("-avoid_negative_ts").output_arg("make_zero")
}

pub fn frame_command(master: &Path, timestamp: f64, output: &Path) -> FfmpegCommand {
    FfmpegCommand::new(master.to_string_lossy(), output.to_string_lossy())
        .output_seek(timestamp)
        .single_frame()
        .output_arg("-q:v").output_arg("2")
}

pub fn spawn(ffmpeg: &FfmpegConfig, cmd: &FfmpegCommand, stdin: bool, stdout: bool) -> Result<Child> {
    let args = cmd.build_args();
    debug!("Spawning: {} {}", ffmpeg.ffmpeg_path, args.join(" "));

    Command::new(&ffmpeg.ffmpeg_path)
        .args(&args)
        .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
        .stdout(if stdout { Stdio::piped() } else { Stdio::null() })
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EdgeError::ffmpeg(format!("Failed to spawn {}: {}", ffmpeg.ffmpeg_path, e)))
}

/// Runs a short-lived command to completion
pub async fn run(ffmpeg: &FfmpegConfig, cmd: &FfmpegCommand) -> Result<()> {
    let args = cmd.build_args();
    debug!("Running: {} {}", ffmpeg.ffmpeg_path, args.join(" "));

    let output = Command::new(&ffmpeg.ffmpeg_path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| EdgeError::ffmpeg(format!("Failed to run {}: {}", ffmpeg.ffmpeg_path, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
        return Err(EdgeError::ffmpeg(format!(
            "ffmpeg exited with {}: {}", output.status, tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        )));
    }
    Ok(())
}

pub async fn probe_duration(ffmpeg: &FfmpegConfig, path: &Path) -> Result<f64> {
    let output = Command::new(&ffmpeg.ffprobe_path)
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "default=noprint_wrappers=1:nokey=1"])
        .arg(path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| EdgeError::ffmpeg(format!("Failed to run {}: {}", ffmpeg.ffprobe_path, e)))?;

    let text = String::from_utf8_lossy(&output.stdout);
    text.trim()
        .parse::<f64>()
        .map_err(|_| EdgeError::ffmpeg(format!("ffprobe returned no duration for {}", path.display())))
}

/// Asks ffmpeg to quit through stdin so the container trailer gets written,
/// then kills it if it is still running after `grace`
pub async fn graceful_stop(child: &mut Child, grace: Duration) -> Result<Option<ExitStatus>> {
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(b"q").await {
            debug!("Could not send quit to ffmpeg: {}", e);
        }
        let _ = stdin.flush().await;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!("ffmpeg exited with {}", status);
            Ok(Some(status))
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            warn!("ffmpeg did not exit within {:?}, killing", grace);
            child.kill().await?;
            Ok(None)
        }
    }
}
