use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

use crate::config::VisionConfig;
use crate::errors::{EdgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectOptions {
    /// Slower, more accurate model used to confirm a subject
    pub live_model: bool,
    pub min_face_size: u32,
    pub scale_factor: f32,
    pub classifier: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub index: usize,
    pub distance: f32,
    pub similarity: f32,
}

#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, jpeg: &Bytes, options: &DetectOptions) -> Result<Vec<FaceRect>>;
}

#[async_trait]
pub trait FaceEmbedder: Send + Sync {
    /// `None` when no face is found in the image
    async fn embed(&self, jpeg: &Bytes) -> Result<Option<Vec<f32>>>;
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<FaceRect>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Option<Vec<f32>>,
}

/// HTTP client for the face inference service
#[derive(Clone)]
pub struct VisionClient {
    client: reqwest::Client,
    base_url: String,
}

impl VisionClient {
    pub fn new(config: &VisionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_image<T: for<'de> Deserialize<'de>>(&self, path: &str, query: &[(&str, String)], jpeg: &Bytes) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self.client.post(&url)
            .query(query)
            .header("Content-Type", "image/jpeg")
            .body(jpeg.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EdgeError::vision(format!("{} returned {}: {}", url, status, text)));
        }
        trace!("Vision service {} answered {}", path, status);
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl FaceDetector for VisionClient {
    async fn detect(&self, jpeg: &Bytes, options: &DetectOptions) -> Result<Vec<FaceRect>> {
        let query = [
            ("live_model", options.live_model.to_string()),
            ("min_face_size", options.min_face_size.to_string()),
            ("scale_factor", options.scale_factor.to_string()),
            ("classifier", options.classifier.clone()),
        ];
        let response: DetectResponse = self.post_image("detect", &query, jpeg).await?;
        Ok(response.faces)
    }
}

#[async_trait]
impl FaceEmbedder for VisionClient {
    async fn embed(&self, jpeg: &Bytes) -> Result<Option<Vec<f32>>> {
        let response: EmbedResponse = self.post_image("embed", &[], jpeg).await?;
        Ok(response.embedding.filter(|e| !e.is_empty()))
    }
}

/// Stand-in used when no inference service is configured: never sees a face
pub struct DisabledVision;

#[async_trait]
impl FaceDetector for DisabledVision {
    async fn detect(&self, _jpeg: &Bytes, _options: &DetectOptions) -> Result<Vec<FaceRect>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl FaceEmbedder for DisabledVision {
    async fn embed(&self, _jpeg: &Bytes) -> Result<Option<Vec<f32>>> {
        Ok(None)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

/// Best match of `vector` among a matcher's embeddings
pub fn match_embedding(vector: &[f32], matcher: &[Vec<f32>]) -> Option<MatchResult> {
    matcher.iter()
        .enumerate()
        .map(|(index, candidate)| {
            let similarity = cosine_similarity(vector, candidate);
            MatchResult { index, distance: 1.0 - similarity, similarity }
        })
        .max_by(|a, b| a.similarity.total_cmp(&b.similarity))
}

/// Crops a detected face out of a JPEG frame and re-encodes it
pub fn crop_face(jpeg: &[u8], rect: &FaceRect) -> Result<Vec<u8>> {
    let image = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)?;
    let x = rect.x.min(image.width().saturating_sub(1));
    let y = rect.y.min(image.height().saturating_sub(1));
    let width = rect.width.min(image.width() - x).max(1);
    let height = rect.height.min(image.height() - y).max(1);

    let face = image.crop_imm(x, y, width, height);
    let mut out = Vec::new();
    face.to_rgb8().write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Jpeg)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_match_embedding_picks_best() {
        let matcher = vec![vec![0.0, 1.0], vec![1.0, 0.1], vec![-1.0, 0.0]];
        let result = match_embedding(&[1.0, 0.0], &matcher).unwrap();
        assert_eq!(result.index, 1);
        assert!((result.distance - (1.0 - result.similarity)).abs() < 1e-6);
        assert!(match_embedding(&[1.0, 0.0], &[]).is_none());
    }

    #[test]
    fn test_crop_face_clamps_to_frame() {
        let frame = image::RgbImage::from_pixel(64, 48, image::Rgb([200, 10, 10]));
        let mut jpeg = Vec::new();
        frame.write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg).unwrap();

        let crop = crop_face(&jpeg, &FaceRect { x: 40, y: 30, width: 100, height: 100 }).unwrap();
        let decoded = image::load_from_memory(&crop).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (24, 18));
    }

    #[test]
    fn test_detect_response_defaults_to_empty() {
        let parsed: DetectResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.faces.is_empty());
        let parsed: EmbedResponse = serde_json::from_str(r#"{"embedding": null}"#).unwrap();
        assert!(parsed.embedding.is_none());
    }
}
