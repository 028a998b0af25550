use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{CameraTuning, FfmpegConfig};
use crate::errors::{EdgeError, Result};
use crate::transcoder;

#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub jpeg: Bytes,
}

/// Splits a concatenated MJPEG byte stream on SOI/EOI markers.
/// Bytes after an EOI are kept for the next frame.
#[derive(Default)]
pub struct MjpegSplitter {
    buffer: Vec<u8>,
}

impl MjpegSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let start = match find_marker(&self.buffer, 0xD8, 0) {
                Some(start) => start,
                None => {
                    // keep a trailing 0xFF in case the marker straddles chunks
                    let keep = usize::from(self.buffer.last() == Some(&0xFF));
                    let drop = self.buffer.len() - keep;
                    self.buffer.drain(..drop);
                    break;
                }
            };
            if start > 0 {
                self.buffer.drain(..start);
            }
            match find_marker(&self.buffer, 0xD9, 2) {
                Some(end) => {
                    let frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
                    frames.push(Bytes::from(frame));
                }
                None => break,
            }
        }
        frames
    }
}

fn find_marker(buffer: &[u8], marker: u8, from: usize) -> Option<usize> {
    if buffer.len() < 2 {
        return None;
    }
    (from..buffer.len() - 1).find(|&i| buffer[i] == 0xFF && buffer[i + 1] == marker)
}

/// Decode subprocess producing sampled JPEG frames for one camera.
///
/// Only the most recent frame is retained; a consumer that falls behind
/// skips frames instead of queueing them.
pub struct FrameSource {
    child: Child,
    reader: JoinHandle<()>,
    frames: watch::Receiver<Option<Frame>>,
}

impl FrameSource {
    pub fn spawn(ffmpeg: &FfmpegConfig, camera_id: i64, stream_uri: &str, tuning: &CameraTuning, fps: u32) -> Result<Self> {
        let cmd = transcoder::decode_pipe_command(ffmpeg, stream_uri, tuning, fps);
        let mut child = transcoder::spawn(ffmpeg, &cmd, false, true)?;

        let stdout = child.stdout.take()
            .ok_or_else(|| EdgeError::ffmpeg("Failed to get decode pipe stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            let log_stderr = ffmpeg.log_stderr;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if log_stderr {
                        debug!("[decode {}] {}", camera_id, line);
                    }
                }
            });
        }

        let (tx, frames) = watch::channel(None);
        let frame_skip = tuning.frame_skip;
        let reader = tokio::spawn(read_frames(camera_id, stdout, tx, frame_skip));

        info!("Decode pipe started for camera {}", camera_id);
        Ok(Self { child, reader, frames })
    }

    /// The newest frame not yet returned, if the pipe produced one since the last call
    pub fn latest(&mut self) -> Option<Frame> {
        match self.frames.has_changed() {
            Ok(true) => self.frames.borrow_and_update().clone(),
            _ => None,
        }
    }

    /// False once the decoder closed its output
    pub fn is_running(&self) -> bool {
        !self.reader.is_finished()
    }

    pub async fn stop(mut self) {
        self.reader.abort();
        if let Err(e) = self.child.kill().await {
            debug!("Decode pipe already gone: {}", e);
        }
    }
}

async fn read_frames(camera_id: i64, stdout: ChildStdout, tx: watch::Sender<Option<Frame>>, frame_skip: u32) {
    let mut reader = BufReader::new(stdout);
    let mut splitter = MjpegSplitter::default();
    let mut chunk = vec![0u8; 64 * 1024];
    let mut seen = 0u64;
    let mut seq = 0u64;

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                warn!("Decode pipe for camera {} reached EOF", camera_id);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("Decode pipe read error for camera {}: {}", camera_id, e);
                break;
            }
        };

        for jpeg in splitter.push(&chunk[..n]) {
            seen += 1;
            if frame_skip > 0 && (seen - 1) % (u64::from(frame_skip) + 1) != 0 {
                continue;
            }
            seq += 1;
            if seq % 500 == 0 {
                trace!("Camera {} decoded {} frames", camera_id, seq);
            }
            if tx.send(Some(Frame { seq, jpeg })).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0xFF, 0xD8];
        v.extend_from_slice(payload);
        v.extend_from_slice(&[0xFF, 0xD9]);
        v
    }

    #[test]
    fn test_splitter_keeps_bytes_after_frame_end() {
        let mut stream = jpeg(&[1, 2, 3]);
        stream.extend(jpeg(&[4, 5]));

        let mut splitter = MjpegSplitter::default();
        let frames = splitter.push(&stream[..9]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &jpeg(&[1, 2, 3])[..]);

        let frames = splitter.push(&stream[9..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &jpeg(&[4, 5])[..]);
    }

    #[test]
    fn test_splitter_handles_marker_across_chunks() {
        let stream = jpeg(&[9, 9]);
        let mut splitter = MjpegSplitter::default();
        assert!(splitter.push(&[0x00, 0xFF]).is_empty());
        assert!(splitter.push(&stream[1..5]).is_empty());
        let frames = splitter.push(&stream[5..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &stream[..]);
    }
}
